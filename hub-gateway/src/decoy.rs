//! Landing content served in place of proxying.

use axum::response::Html;

/// Which embedded page to render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LandingKind {
    /// Registry search front end; submits to `/search?q=`.
    Search,
    /// Stock web-server welcome page, shown to blocked user agents.
    Nginx,
}

pub fn render_landing_page(kind: LandingKind) -> Html<&'static str> {
    match kind {
        LandingKind::Search => Html(include_str!("../static/search.html")),
        LandingKind::Nginx => Html(include_str!("../static/nginx.html")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_are_distinct_html() {
        let Html(search) = render_landing_page(LandingKind::Search);
        let Html(nginx) = render_landing_page(LandingKind::Nginx);

        assert!(search.contains("action=\"/search\""));
        assert!(nginx.contains("Welcome to nginx!"));
        assert!(search.starts_with("<!DOCTYPE html>"));
        assert_ne!(search, nginx);
    }
}
