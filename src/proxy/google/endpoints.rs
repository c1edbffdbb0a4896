use crate::constants::CLOUDCODE_HOSTS;

pub fn v1_internal_base_urls() -> Vec<String> {
    CLOUDCODE_HOSTS
        .iter()
        .map(|host| format!("https://{}/v1internal", host))
        .collect()
}

/// Cloud-Code endpoints use colon-method URLs: `<base>:<method>[?query]`.
pub fn build_url(base_url: &str, method: &str, query: Option<&str>) -> String {
    match query {
        Some(qs) if !qs.trim().is_empty() => format!("{}:{}?{}", base_url, method, qs),
        _ => format!("{}:{}", base_url, method),
    }
}

pub fn endpoint_load_code_assist(base_url: &str) -> String {
    build_url(base_url, "loadCodeAssist", None)
}
