/// Trim a raw device id; network-attached ids get their loopback spellings
/// folded together so the same device never appears twice in the registry.
pub fn normalize_device_id(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains(':') {
        return normalize_network_addr(trimmed);
    }
    trimmed.to_string()
}

pub fn normalize_network_addr(addr: &str) -> String {
    let addr = addr.trim();
    let lower = addr.to_ascii_lowercase();
    if let Some(rest) = lower.strip_prefix("localhost:") {
        return format!("127.0.0.1:{rest}");
    }
    if let Some(rest) = lower.strip_prefix("0.0.0.0:") {
        return format!("127.0.0.1:{rest}");
    }
    if let Some(rest) = lower.strip_prefix("[::1]:") {
        return format!("127.0.0.1:{rest}");
    }
    if let Some(rest) = lower.strip_prefix("[::]:") {
        return format!("127.0.0.1:{rest}");
    }
    addr.to_string()
}

/// A device id names a network transport exactly when it contains a single
/// colon; the part before it is the address.
pub fn network_address(id: &str) -> Option<&str> {
    if id.matches(':').count() == 1 {
        id.split(':').next()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usb_serials_pass_through() {
        assert_eq!(normalize_device_id("  ABCD1234 "), "ABCD1234");
        assert_eq!(network_address("ABCD1234"), None);
    }

    #[test]
    fn loopback_spellings_are_folded() {
        assert_eq!(normalize_device_id("localhost:5555"), "127.0.0.1:5555");
        assert_eq!(normalize_device_id("[::1]:5555"), "127.0.0.1:5555");
        assert_eq!(normalize_device_id("192.168.1.5:5555"), "192.168.1.5:5555");
    }

    #[test]
    fn network_address_requires_exactly_one_colon() {
        assert_eq!(network_address("192.168.1.5:5555"), Some("192.168.1.5"));
        assert_eq!(network_address("weird:id:extra"), None);
    }
}
