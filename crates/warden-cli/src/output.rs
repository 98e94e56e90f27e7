use serde_json::Value;

/// Render the configuration list as human-readable text.
pub fn render_configs(configs: Vec<Value>) -> String {
    if configs.is_empty() {
        return "No recovery configurations.\n".to_string();
    }
    let mut out = String::new();
    for c in configs {
        out.push_str(&format!(
            "{}  {:<8}  created {}\n",
            c["uuid"].as_str().unwrap_or("?"),
            c["state"].as_str().unwrap_or("?"),
            c["created"].as_str().unwrap_or("?"),
        ));
    }
    out
}

/// Render the PIV token list as human-readable text.
pub fn render_pivtokens(tokens: Vec<Value>) -> String {
    if tokens.is_empty() {
        return "No PIV tokens.\n".to_string();
    }
    let mut out = String::new();
    for t in tokens {
        let chain_len = t["recovery_tokens"].as_array().map(|a| a.len()).unwrap_or(0);
        out.push_str(&format!(
            "{}  cn {}  {} recovery token(s)\n",
            t["guid"].as_str().unwrap_or("?"),
            t["cn_uuid"].as_str().unwrap_or("?"),
            chain_len,
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_lists_have_placeholder_lines() {
        assert_eq!(render_configs(vec![]), "No recovery configurations.\n");
        assert_eq!(render_pivtokens(vec![]), "No PIV tokens.\n");
    }

    #[test]
    fn config_rows_show_uuid_and_state() {
        let out = render_configs(vec![json!({
            "uuid": "10bee382-52ce-552c-95b8-f7bc40cce8dc",
            "state": "active",
            "created": "2025-06-01T00:00:00Z",
        })]);
        assert!(out.contains("10bee382-52ce-552c-95b8-f7bc40cce8dc"));
        assert!(out.contains("active"));
    }

    #[test]
    fn token_rows_count_the_chain() {
        let out = render_pivtokens(vec![json!({
            "guid": "97496DD1C8F053DE7450CD854D9C95B4",
            "cn_uuid": "15966912-8fad-41cd-bd82-abe6468354b5",
            "recovery_tokens": [{}, {}],
        })]);
        assert!(out.contains("2 recovery token(s)"));
    }
}
