use common::AudienceMember;

/// Substitute recipient placeholders into a template. `{name}` falls
/// back from first name to username.
pub(crate) fn render_placeholders(template: &str, recipient: &AudienceMember) -> String {
    let first = recipient.first_name.as_deref().unwrap_or("");
    let last = recipient.last_name.as_deref().unwrap_or("");
    let username = recipient.username.as_deref().unwrap_or("");
    let name = recipient
        .first_name
        .as_deref()
        .filter(|s| !s.is_empty())
        .or(recipient.username.as_deref())
        .unwrap_or("");

    template
        .replace("{first_name}", first)
        .replace("{last_name}", last)
        .replace("{username}", username)
        .replace("{name}", name)
}
