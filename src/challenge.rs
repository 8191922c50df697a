//! Challenge provider contract
//!
//! The fixed surface of the reCAPTCHA Enterprise provider: canonical page
//! URLs, the synthetic host page served in place of the real site, the
//! readiness probe and the execute snippet. The provider's script exposes a
//! single API we consume: `grecaptcha.enterprise.execute(siteKey, {action})`.

/// Site key of the protected resource
pub const DEFAULT_SITE_KEY: &str = "6LdsFiUsAAAAAIjVDZcuLhaHiDn5nnHVXVRQGeMV";

/// Default action label passed to execute
pub const DEFAULT_ACTION: &str = "IMAGE_GENERATION";

/// Hosts whose requests pass through the route filter; everything else is
/// aborted to keep attempts fast and fingerprint surface minimal.
pub const PROVIDER_HOSTS: &[&str] = &["google.com", "gstatic.com", "recaptcha.net"];

/// Init-time override hiding the automation flag
pub const WEBDRIVER_OVERRIDE: &str =
    "Object.defineProperty(navigator, 'webdriver', {get: () => undefined});";

/// Expression that becomes truthy once the challenge library is loaded
pub const LIBRARY_READY: &str = "typeof grecaptcha !== 'undefined'";

/// Name of the authentication cookie carrying the signed-in session
pub const SESSION_COOKIE: &str = "__Secure-next-auth.session-token";

/// Inner JavaScript-side timeout on the execute promise, milliseconds.
/// Kept below the outer Rust-side timeout so the page rejects first.
const EXECUTE_TIMEOUT_MS: u32 = 25_000;

/// Canonical URL of the protected page for a project
pub fn page_url(project_id: &str) -> String {
    format!("https://labs.google/fx/tools/flow/project/{}", project_id)
}

/// Promise-wrapped execute call, evaluated with await-promise semantics.
/// Resolves to the token string or rejects on provider error / timeout.
pub fn execute_snippet(site_key: &str, action: &str) -> String {
    format!(
        r#"(() => new Promise((resolve, reject) => {{
    const timer = setTimeout(() => reject(new Error('execute timed out')), {timeout});
    grecaptcha.enterprise.execute('{site_key}', {{action: '{action}'}})
        .then((token) => {{ clearTimeout(timer); resolve(token); }})
        .catch((err) => {{ clearTimeout(timer); reject(err); }});
}}))()"#,
        timeout = EXECUTE_TIMEOUT_MS,
        site_key = site_key,
        action = action,
    )
}

/// Minimal synthetic host page embedding the challenge script.
///
/// Served by the route filter for the canonical page URL so the challenge
/// runs against the real origin without loading the real application.
pub fn host_page(site_key: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="utf-8">
    <meta name="viewport" content="width=device-width, initial-scale=1">
    <title>Flow - Google Labs</title>
    <meta name="description" content="Create videos and images with AI using Flow on Google Labs">
    <link rel="icon" href="https://labs.google/favicon.ico">
    <script src="https://www.google.com/recaptcha/enterprise.js?render={site_key}"></script>
    <style>
        * {{ margin: 0; padding: 0; box-sizing: border-box; }}
        body {{ font-family: 'Google Sans', Roboto, Arial, sans-serif; background: #131314; color: #e3e3e3; min-height: 100vh; }}
        header {{ display: flex; align-items: center; padding: 12px 24px; border-bottom: 1px solid #3c4043; }}
        header .logo {{ font-size: 18px; font-weight: 500; color: #8ab4f8; }}
        .main {{ max-width: 960px; margin: 40px auto; padding: 0 24px; }}
        .prompt-area {{ background: #1e1f20; border-radius: 12px; padding: 20px; }}
        .prompt-input {{ width: 100%; background: transparent; border: none; color: #e3e3e3; font-size: 16px; outline: none; resize: none; min-height: 60px; font-family: inherit; }}
        .btn {{ padding: 8px 24px; border-radius: 20px; border: none; font-size: 14px; cursor: pointer; background: #8ab4f8; color: #202124; margin-top: 16px; }}
        .gallery {{ display: grid; grid-template-columns: repeat(2, 1fr); gap: 16px; margin-top: 24px; }}
        .gallery-item {{ background: #1e1f20; border-radius: 8px; aspect-ratio: 16/9; }}
    </style>
</head>
<body>
    <header><div class="logo">Flow</div></header>
    <div class="main">
        <h1>My Project</h1>
        <div class="prompt-area">
            <textarea class="prompt-input" placeholder="Describe what you want to create..." rows="3"></textarea>
            <button class="btn">Generate</button>
        </div>
        <div class="gallery">
            <div class="gallery-item"></div>
            <div class="gallery-item"></div>
            <div class="gallery-item"></div>
            <div class="gallery-item"></div>
        </div>
    </div>
</body>
</html>"#,
        site_key = site_key,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_url() {
        assert_eq!(
            page_url("abc123"),
            "https://labs.google/fx/tools/flow/project/abc123"
        );
    }

    #[test]
    fn test_host_page_embeds_site_key() {
        let html = host_page("test-key");
        assert!(html.contains("enterprise.js?render=test-key"));
        assert!(html.contains("<textarea"));
    }

    #[test]
    fn test_execute_snippet_shape() {
        let js = execute_snippet("k", "IMAGE_GENERATION");
        assert!(js.contains("grecaptcha.enterprise.execute('k'"));
        assert!(js.contains("action: 'IMAGE_GENERATION'"));
        assert!(js.contains("new Promise"));
    }
}
