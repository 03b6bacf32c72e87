//! User agent classification

use mailpipe_storage::models::{DeviceType, EmailClient};

/// Classify a user agent into (device, mail client)
pub fn classify(user_agent: Option<&str>) -> (DeviceType, EmailClient) {
    match user_agent.map(str::trim).filter(|ua| !ua.is_empty()) {
        Some(ua) => {
            let ua = ua.to_ascii_lowercase();
            (device_type(&ua), email_client(&ua))
        }
        None => (DeviceType::Unknown, EmailClient::Other),
    }
}

fn device_type(ua: &str) -> DeviceType {
    if ua.contains("ipad")
        || ua.contains("tablet")
        || (ua.contains("android") && !ua.contains("mobile"))
    {
        DeviceType::Tablet
    } else if ua.contains("mobile") || ua.contains("iphone") || ua.contains("android") {
        DeviceType::Mobile
    } else if ua.contains("windows")
        || ua.contains("macintosh")
        || ua.contains("mac os")
        || ua.contains("linux")
        || ua.contains("x11")
    {
        DeviceType::Desktop
    } else {
        DeviceType::Unknown
    }
}

fn email_client(ua: &str) -> EmailClient {
    if ua.contains("gmail") || ua.contains("googleimageproxy") {
        EmailClient::Gmail
    } else if ua.contains("outlook") || ua.contains("microsoft office") {
        EmailClient::Outlook
    } else if ua.contains("yahoo") {
        EmailClient::Yahoo
    } else if ua.contains("thunderbird") {
        EmailClient::Thunderbird
    } else if (ua.contains("applewebkit") || ua.contains("apple mail") || ua.contains("mac os"))
        && !ua.contains("chrome")
    {
        // Apple Mail loads images with a bare WebKit agent
        EmailClient::AppleMail
    } else {
        EmailClient::Other
    }
}
