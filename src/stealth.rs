//! Best-effort automation masking and human-like pacing.
//!
//! None of this guarantees defeat of anti-automation systems; it lowers the
//! obvious signals (webdriver flag, empty plugin list, robotic timing) so
//! that the protection detector sees the real page more often.

use crate::session::BrowserSession;
use rand::seq::SliceRandom;
use rand::Rng;
use std::time::Duration;

/// Realistic user agents across browsers and platforms.
const USER_AGENTS: [&str; 8] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:109.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:109.0) Gecko/20100101 Firefox/120.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:109.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Safari/605.1.15",
];

/// Injected before any page script runs; masks common automation tells.
pub const MASKING_SCRIPT: &str = r#"
Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
Object.defineProperty(navigator, 'languages', { get: () => ['en-US', 'en'] });
Object.defineProperty(navigator, 'plugins', { get: () => [1, 2, 3, 4, 5] });
Object.defineProperty(screen, 'colorDepth', { get: () => 24 });
window.chrome = window.chrome || { runtime: {} };
if (window.navigator.permissions) {
    const originalQuery = window.navigator.permissions.query.bind(window.navigator.permissions);
    window.navigator.permissions.query = (parameters) => (
        parameters.name === 'notifications'
            ? Promise.resolve({ state: Notification.permission })
            : originalQuery(parameters)
    );
}
"#;

/// Pick a user agent at random.
pub fn random_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(USER_AGENTS[0])
}

/// Sleep a random duration in `[min_secs, max_secs)`.
pub async fn human_delay(min_secs: f64, max_secs: f64) {
    let secs = rand::thread_rng().gen_range(min_secs..max_secs);
    tokio::time::sleep(Duration::from_secs_f64(secs)).await;
}

/// Scroll a little and idle briefly, like a person skimming the page.
///
/// Failures are ignored: behavior simulation must never abort an attempt.
pub async fn simulate_human_behavior(session: &dyn BrowserSession) {
    let scroll_to = rand::thread_rng().gen_range(0..500);
    let script = format!(
        "window.scrollTo({{ top: {scroll_to}, behavior: 'smooth' }}); true"
    );
    let _ = session.evaluate(&script).await;
    human_delay(0.5, 1.5).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_agent_pool() {
        for _ in 0..20 {
            let ua = random_user_agent();
            assert!(ua.starts_with("Mozilla/5.0"));
        }
    }

    #[test]
    fn test_masking_script_covers_webdriver() {
        assert!(MASKING_SCRIPT.contains("webdriver"));
        assert!(MASKING_SCRIPT.contains("plugins"));
    }
}
