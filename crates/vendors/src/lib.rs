//! Clients for the external collaborators: the SMS rental vendor, the
//! optional LLM service, and the one-way operator notifier. Each is a
//! trait with a live HTTP implementation and a scripted in-memory one
//! for tests.

mod llm;
mod notifier;
mod sms;

pub use llm::{LlmService, NoLlm, OpenAiCompatClient};
pub use notifier::{NullNotifier, RecordingNotifier, Notifier, TelegramNotifier};
pub use sms::{OnlineSmsClient, RentedNumber, ScriptedSms, SmsVendor};
