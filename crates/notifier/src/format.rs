/// Notification body for a newly discovered item.
pub fn format_body(link: &str, title: &str) -> String {
    format!("{link}\n\n{title}")
}

/// Alert sent once a subscription reaches the failure threshold.
pub fn failure_alert_body(subscription_url: &str, failures: u32, last_error: &str) -> String {
    format!(
        "watchpost: subscription {subscription_url} has failed {failures} consecutive checks. Last error: {last_error}"
    )
}

/// Alert repeated on every run once a subscription keeps failing.
pub fn escalated_alert_body(subscription_url: &str, destination_name: &str, failures: u32) -> String {
    format!(
        "watchpost: subscription {subscription_url} has been failing for {failures} consecutive checks. \
         Consider removing it from destination \"{destination_name}\"."
    )
}

/// Hide credentials embedded in a transport URL, keeping the scheme.
///
/// `slack://TokenA/TokenB/TokenC` becomes `slack://Toke...kenC`.
pub fn mask_url(url: &str) -> String {
    let Some(scheme_end) = url.find("://") else {
        return url.to_string();
    };

    let (scheme, rest) = url.split_at(scheme_end + 3);
    let chars: Vec<char> = rest.chars().collect();

    if chars.len() < 8 {
        return format!("{scheme}***");
    }

    let head: String = chars[..4].iter().collect();
    if chars.len() < 16 {
        return format!("{scheme}{head}...");
    }

    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{scheme}{head}...{tail}")
}
