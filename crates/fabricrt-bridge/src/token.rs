//! Cookie-based auth token extraction (spec.md §4.4 "Token extraction").

use std::collections::HashSet;

use crate::error::BridgeError;

/// Extracts `(tokenType, tokenData)` from a request's `Cookie` header under
/// the bridge's configured policy.
pub fn extract_token(
    cookie_header: Option<&str>,
    token_cookie_names: &HashSet<String>,
    token_type_default: &str,
    token_data_default: &str,
) -> Result<(String, String), BridgeError> {
    let mut found = Vec::new();
    if let Some(header) = cookie_header {
        for raw in header.split(';') {
            let cookie = raw.trim();
            if cookie.is_empty() {
                continue;
            }
            let name = cookie.split('=').next().unwrap_or(cookie).trim();
            if token_cookie_names.contains(cookie) || token_cookie_names.contains(name) {
                found.push(cookie.to_string());
            }
        }
    }

    let token_data = if found.is_empty() {
        token_data_default.to_string()
    } else {
        found.join("; ")
    };

    let auth_configured = !token_cookie_names.is_empty() || !token_type_default.is_empty();
    if auth_configured && token_data.is_empty() {
        return Err(BridgeError::PermissionDenied(
            "Authentication information is required".to_string(),
        ));
    }

    Ok((token_type_default.to_string(), token_data))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn recognized_cookie_is_extracted_verbatim() {
        let result = extract_token(
            Some("AUTH=abc; other=xyz"),
            &names(&["AUTH"]),
            "cookie",
            "",
        )
        .unwrap();
        assert_eq!(result.0, "cookie");
        assert_eq!(result.1, "AUTH=abc");
    }

    #[test]
    fn missing_token_with_policy_configured_is_denied() {
        let err = extract_token(Some("other=xyz"), &names(&["AUTH"]), "cookie", "").unwrap_err();
        assert!(matches!(err, BridgeError::PermissionDenied(_)));
    }

    #[test]
    fn no_policy_configured_falls_back_to_default() {
        let result = extract_token(None, &names(&[]), "", "anonymous").unwrap();
        assert_eq!(result.1, "anonymous");
    }
}
