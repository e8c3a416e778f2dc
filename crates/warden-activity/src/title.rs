//! Window title clean-up applied just before a segment is emitted.

const BROWSERS: [&str; 3] = ["chrome", "firefox", "msedge"];
const BROWSER_SUFFIXES: [&str; 4] = ["Chrome", "Firefox", "Edge", "Mozilla"];

/// Rewrite browser titles to `"<page> — <host>"` when a host can be found.
///
/// Titles of other processes are returned unchanged.
pub fn enrich_title(process_name: &str, title: &str) -> String {
    let process = process_name.to_lowercase();
    if BROWSERS.iter().any(|b| process.contains(b)) {
        browser_title(title)
    } else {
        title.to_string()
    }
}

fn browser_title(title: &str) -> String {
    let parts: Vec<&str> = title.split(" - ").collect();
    if parts.len() < 2 {
        return title.to_string();
    }
    let page = parts[0];

    parts
        .iter()
        .rev()
        .map(|p| p.trim())
        .filter(|p| !BROWSER_SUFFIXES.iter().any(|s| p.contains(s)))
        .find(|p| p.contains('.') && !p.contains(' '))
        .map(|part| format!("{} — {}", page, host_of(part)))
        .unwrap_or_else(|| title.to_string())
}

fn host_of(part: &str) -> &str {
    let rest = part.split_once("://").map_or(part, |(_, rest)| rest);
    let rest = rest.split('/').next().unwrap_or(rest);
    rest.split('?').next().unwrap_or(rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chrome_title_with_host() {
        assert_eq!(
            enrich_title("chrome.exe", "Pull requests - github.com - Google Chrome"),
            "Pull requests — github.com"
        );
    }

    #[test]
    fn test_url_is_reduced_to_host() {
        assert_eq!(
            enrich_title(
                "firefox.exe",
                "tokio - https://docs.rs/tokio/latest/tokio?search=x - Mozilla Firefox"
            ),
            "tokio — docs.rs"
        );
        assert_eq!(
            enrich_title("msedge.exe", "Mail - www.example.org/inbox - Microsoft Edge"),
            "Mail — www.example.org"
        );
    }

    #[test]
    fn test_browser_title_without_host_unchanged() {
        let title = "New Tab - Google Chrome";
        assert_eq!(enrich_title("chrome.exe", title), title);
        assert_eq!(enrich_title("Chrome.EXE", "Inbox"), "Inbox");
    }

    #[test]
    fn test_other_processes_unchanged() {
        let title = "main.rs - warden - Visual Studio Code";
        assert_eq!(enrich_title("Code.exe", title), title);
    }
}
