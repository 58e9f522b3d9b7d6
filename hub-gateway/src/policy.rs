//! User-agent checks applied before routing.

/// Returns true when `user_agent` contains any blocklist entry, ignoring case.
pub fn should_block(user_agent: &str, blocklist: &[String]) -> bool {
    let ua = user_agent.to_lowercase();
    blocklist
        .iter()
        .filter(|entry| !entry.is_empty())
        .any(|entry| ua.contains(&entry.to_lowercase()))
}

/// Splits a blocklist override on whitespace, `|`, quotes and commas.
pub fn parse_blocklist(raw: &str) -> Vec<String> {
    raw.split(|c: char| c.is_whitespace() || matches!(c, '|' | '"' | '\'' | ','))
        .filter(|s| !s.is_empty())
        .map(|s| s.to_lowercase())
        .collect()
}

/// Browsers identify themselves with `Mozilla`; registry clients do not.
pub fn is_browser(user_agent: &str) -> bool {
    user_agent.to_lowercase().contains("mozilla")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> Vec<String> {
        ["netcraft", "zgrab", "masscan", "nmap", "sqlmap", "wpscan", "nikto"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn blocks_case_insensitively() {
        assert!(should_block("Mozilla/5.0 (compatible; NetcraftSurveyAgent/1.0)", &defaults()));
        assert!(should_block("zgrab/0.x", &defaults()));
        assert!(!should_block("docker/27.0.3 go/go1.21.11", &defaults()));
    }

    #[test]
    fn empty_entries_never_match() {
        assert!(!should_block("anything", &[String::new()]));
    }

    #[test]
    fn blocklist_separators() {
        assert_eq!(
            parse_blocklist("curl|Wget, \"python\"\n\t'Go-http-client'  ,,"),
            vec!["curl", "wget", "python", "go-http-client"]
        );
        assert!(parse_blocklist("  ,| ").is_empty());
    }

    #[test]
    fn browser_detection() {
        assert!(is_browser("Mozilla/5.0 (X11; Linux x86_64)"));
        assert!(!is_browser("containerd/1.7.18"));
    }
}
