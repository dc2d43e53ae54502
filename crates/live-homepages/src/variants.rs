/// Candidate homepage URLs for a domain, in the order they are tried.
///
/// TLS before plain HTTP, and the `www` host before the bare one.
pub fn url_variants(domain: &str) -> [String; 4] {
    [
        format!("https://www.{domain}/"),
        format!("https://{domain}/"),
        format!("http://www.{domain}/"),
        format!("http://{domain}/"),
    ]
}
