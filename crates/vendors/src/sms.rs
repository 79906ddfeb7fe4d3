use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use common::{Error, Result};

/// A rented phone number; `tzid` keys every later operation on it.
#[derive(Debug, Clone)]
pub struct RentedNumber {
    pub number: String,
    pub tzid: i64,
}

/// The SMS rental vendor, reduced to what the factory needs.
#[async_trait]
pub trait SmsVendor: Send + Sync {
    async fn balance(&self) -> Result<f64>;

    async fn rent_number(&self, service: &str, country: &str) -> Result<RentedNumber>;

    /// Poll until the vendor has received the SMS or `timeout` elapses.
    async fn poll_code(&self, tzid: i64, timeout: Duration) -> Result<Option<String>>;

    /// Confirm the number was consumed successfully.
    async fn confirm(&self, tzid: i64) -> Result<()>;

    /// Release an unused number back to the vendor.
    async fn cancel(&self, tzid: i64) -> Result<()>;
}

/// HTTP client for an OnlineSim-style rental API. Plain GET endpoints
/// authenticated by an `apikey` query parameter.
pub struct OnlineSmsClient {
    base_url: String,
    api_key: String,
    http: Client,
    poll_interval: Duration,
}

impl OnlineSmsClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            http: Client::builder()
                .use_rustls_tls()
                .build()
                .expect("Failed to build HTTP client"),
            poll_interval: Duration::from_secs(5),
        }
    }

    async fn get(&self, path: &str, params: &str) -> Result<String> {
        let url = format!(
            "{}/{path}?apikey={}&{params}",
            self.base_url.trim_end_matches('/'),
            self.api_key
        );
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;
        let status = resp.status();
        let body = resp.text().await.map_err(|e| Error::Http(e.to_string()))?;
        if !status.is_success() {
            return Err(Error::Vendor(format!("HTTP {status}: {body}")));
        }
        Ok(body)
    }
}

#[async_trait]
impl SmsVendor for OnlineSmsClient {
    async fn balance(&self) -> Result<f64> {
        let body = self.get("api/getBalance.php", "").await?;
        let resp: BalanceResponse =
            serde_json::from_str(&body).map_err(|e| Error::Vendor(e.to_string()))?;
        resp.balance
            .parse::<f64>()
            .map_err(|e| Error::Vendor(e.to_string()))
    }

    async fn rent_number(&self, service: &str, country: &str) -> Result<RentedNumber> {
        let body = self
            .get("api/getNum.php", &format!("service={service}&country={country}"))
            .await?;
        let resp: GetNumResponse =
            serde_json::from_str(&body).map_err(|e| Error::Vendor(e.to_string()))?;
        if resp.response != "1" {
            return Err(Error::Vendor(format!("getNum refused: {}", resp.response)));
        }
        let number = resp
            .number
            .ok_or_else(|| Error::Vendor("getNum returned no number".into()))?;
        let tzid = resp
            .tzid
            .ok_or_else(|| Error::Vendor("getNum returned no tzid".into()))?;
        debug!(tzid, "rented number");
        Ok(RentedNumber { number, tzid })
    }

    async fn poll_code(&self, tzid: i64, timeout: Duration) -> Result<Option<String>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let body = self
                .get("api/getState.php", &format!("tzid={tzid}&message_to_code=1"))
                .await?;
            // getState returns an array of operation states.
            let states: Vec<StateResponse> =
                serde_json::from_str(&body).map_err(|e| Error::Vendor(e.to_string()))?;
            if let Some(code) = states
                .iter()
                .find(|s| s.tzid == tzid)
                .and_then(|s| s.msg.clone())
            {
                if !code.is_empty() {
                    return Ok(Some(code));
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn confirm(&self, tzid: i64) -> Result<()> {
        self.get("api/setOperationOk.php", &format!("tzid={tzid}")).await?;
        Ok(())
    }

    async fn cancel(&self, tzid: i64) -> Result<()> {
        self.get("api/setOperationRevise.php", &format!("tzid={tzid}")).await?;
        Ok(())
    }
}

// ─── Response types ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct BalanceResponse {
    balance: String,
}

#[derive(Deserialize)]
struct GetNumResponse {
    response: String,
    #[serde(default)]
    number: Option<String>,
    #[serde(default)]
    tzid: Option<i64>,
}

#[derive(Deserialize)]
struct StateResponse {
    tzid: i64,
    #[serde(default)]
    msg: Option<String>,
}

// ─── Scripted vendor for tests ────────────────────────────────────────────────

/// In-memory vendor: numbers and codes are queued by the test, every
/// operation is recorded.
#[derive(Default)]
pub struct ScriptedSms {
    state: Mutex<ScriptedState>,
}

#[derive(Default)]
struct ScriptedState {
    balance: f64,
    numbers: Vec<RentedNumber>,
    codes: HashMap<i64, String>,
    confirmed: Vec<i64>,
    cancelled: Vec<i64>,
}

impl ScriptedSms {
    pub fn new(balance: f64) -> Self {
        let sms = Self::default();
        sms.state.lock().unwrap().balance = balance;
        sms
    }

    pub fn add_number(&self, number: &str, tzid: i64, code: Option<&str>) {
        let mut state = self.state.lock().unwrap();
        state.numbers.push(RentedNumber {
            number: number.to_string(),
            tzid,
        });
        if let Some(code) = code {
            state.codes.insert(tzid, code.to_string());
        }
    }

    pub fn confirmed(&self) -> Vec<i64> {
        self.state.lock().unwrap().confirmed.clone()
    }

    pub fn cancelled(&self) -> Vec<i64> {
        self.state.lock().unwrap().cancelled.clone()
    }
}

#[async_trait]
impl SmsVendor for ScriptedSms {
    async fn balance(&self) -> Result<f64> {
        Ok(self.state.lock().unwrap().balance)
    }

    async fn rent_number(&self, _service: &str, _country: &str) -> Result<RentedNumber> {
        self.state
            .lock()
            .unwrap()
            .numbers
            .pop()
            .ok_or_else(|| Error::Vendor("no numbers available".into()))
    }

    async fn poll_code(&self, tzid: i64, _timeout: Duration) -> Result<Option<String>> {
        Ok(self.state.lock().unwrap().codes.get(&tzid).cloned())
    }

    async fn confirm(&self, tzid: i64) -> Result<()> {
        self.state.lock().unwrap().confirmed.push(tzid);
        Ok(())
    }

    async fn cancel(&self, tzid: i64) -> Result<()> {
        self.state.lock().unwrap().cancelled.push(tzid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_vendor_hands_out_numbers_and_codes() {
        let sms = ScriptedSms::new(100.0);
        sms.add_number("+79011234455", 42, Some("12345"));

        assert_eq!(sms.balance().await.unwrap(), 100.0);
        let rented = sms.rent_number("telegram", "ru").await.unwrap();
        assert_eq!(rented.tzid, 42);
        let code = sms.poll_code(42, Duration::from_secs(1)).await.unwrap();
        assert_eq!(code.as_deref(), Some("12345"));

        sms.confirm(42).await.unwrap();
        assert_eq!(sms.confirmed(), vec![42]);
        assert!(sms.rent_number("telegram", "ru").await.is_err());
    }
}
