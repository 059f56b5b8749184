use regex::Regex;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::brand::BrandSettings;
use crate::utils::generate_short_code;

/// Literal placeholder the provider expands per recipient in broadcast
/// sends. Passed through rendering untouched.
pub const BROADCAST_UNSUBSCRIBE_PLACEHOLDER: &str = "{{{RESEND_UNSUBSCRIBE_URL}}}";

/// What the short-link rewriter attributes allocated codes to.
#[derive(Debug, Clone, Copy)]
pub enum ShortenScope {
    Campaign(Uuid),
    SequenceStep(Uuid),
}

pub struct PersonalizeInput<'a> {
    pub template_id: &'a str,
    pub subject: &'a str,
    pub brand: &'a BrandSettings,
    pub subscriber_name: Option<&'a str>,
    pub unsubscribe_url: &'a str,
    pub site_url: &'a str,
}

/// Shared body pass, run once per dispatch: Markdown conversion,
/// linkification, short-link rewriting. `{{…}}` tokens pass through so
/// the result can still be personalised per recipient; short codes are
/// allocated once per campaign/step, not per recipient.
pub async fn prepare_body(
    pool: &PgPool,
    content: &str,
    shorten: Option<ShortenScope>,
    short_base: &str,
) -> anyhow::Result<String> {
    let mut html = if looks_like_markdown(content) {
        markdown_to_html(content)
    } else {
        content.to_string()
    };

    html = linkify(&html);

    if let Some(scope) = shorten {
        html = shorten_links(pool, &html, scope, short_base, "").await?;
    }

    Ok(html)
}

/// Per-recipient pass: variable substitution, paragraph normalisation,
/// preset wrapping.
pub fn personalize(body: &str, input: &PersonalizeInput<'_>) -> String {
    let substituted = replace_variables(
        body,
        input.subscriber_name,
        input.unsubscribe_url,
        &input.brand.primary_color,
    );
    let normalized = normalize_empty_paragraphs(&substituted);
    wrap_preset(
        input.template_id,
        input.subject,
        &normalized,
        input.brand,
        input.unsubscribe_url,
        input.site_url,
    )
}

/// Full single-recipient render, used by previews and test sends.
pub async fn render_email(
    pool: &PgPool,
    content: &str,
    input: &PersonalizeInput<'_>,
    shorten: Option<ShortenScope>,
    short_base: &str,
) -> anyhow::Result<String> {
    let body = prepare_body(pool, content, shorten, short_base).await?;
    Ok(personalize(&body, input))
}

/// Substitute recognised `{{…}}` tokens. Unknown tokens are left alone, so
/// the function is idempotent on token-free content.
pub fn replace_variables(
    content: &str,
    subscriber_name: Option<&str>,
    unsubscribe_url: &str,
    link_color: &str,
) -> String {
    let name = subscriber_name.unwrap_or("");
    let unsubscribe_anchor = format!(
        "<a href=\"{}\" style=\"color: {}; text-decoration: underline;\">Unsubscribe</a>",
        unsubscribe_url, link_color
    );
    content
        .replace("{{subscriber.name}}", name)
        .replace("{{name}}", name)
        .replace("{{unsubscribe_url}}", &unsubscribe_anchor)
}

/// Content with no block-level HTML is treated as Markdown.
pub fn looks_like_markdown(content: &str) -> bool {
    const BLOCK_TAGS: &[&str] = &[
        "<p", "<div", "<table", "<h1", "<h2", "<h3", "<h4", "<h5", "<h6", "<ul", "<ol", "<br",
        "<blockquote",
    ];
    let lowered = content.to_lowercase();
    !BLOCK_TAGS.iter().any(|tag| lowered.contains(tag))
}

fn markdown_to_html(content: &str) -> String {
    let mut options = pulldown_cmark::Options::empty();
    options.insert(pulldown_cmark::Options::ENABLE_TABLES);
    options.insert(pulldown_cmark::Options::ENABLE_STRIKETHROUGH);
    let parser = pulldown_cmark::Parser::new_ext(content, options);
    let mut html = String::new();
    pulldown_cmark::html::push_html(&mut html, parser);
    html
}

/// Turn bare URLs into anchors and YouTube links into clickable
/// thumbnails. URLs already inside an `href` attribute or an anchor body
/// are left alone; the regex crate has no lookbehind, so the surrounding
/// context is inspected manually.
pub fn linkify(html: &str) -> String {
    let url_re = Regex::new(r#"https?://[^\s<>"']+"#).unwrap();
    let mut out = String::with_capacity(html.len());
    let mut last_end = 0;

    for m in url_re.find_iter(html) {
        out.push_str(&html[last_end..m.start()]);
        let url = m.as_str();
        let before = &html[..m.start()];

        if inside_href(before) || inside_anchor_body(before) {
            out.push_str(url);
        } else if let Some(video_id) = youtube_video_id(url) {
            out.push_str(&format!(
                "<a href=\"{url}\"><img src=\"https://img.youtube.com/vi/{video_id}/maxresdefault.jpg\" \
                 alt=\"YouTube video\" style=\"max-width: 100%; height: auto;\" /></a>"
            ));
        } else {
            out.push_str(&format!("<a href=\"{url}\">{url}</a>"));
        }
        last_end = m.end();
    }
    out.push_str(&html[last_end..]);
    out
}

fn inside_href(before: &str) -> bool {
    before.ends_with("href=\"") || before.ends_with("href='") || before.ends_with("src=\"")
}

fn inside_anchor_body(before: &str) -> bool {
    let last_open = before.rfind("<a ").or_else(|| before.rfind("<a>"));
    let last_close = before.rfind("</a>");
    match (last_open, last_close) {
        (Some(open), Some(close)) => open > close,
        (Some(_), None) => true,
        _ => false,
    }
}

/// Recognise watch/short/embed YouTube URL forms.
pub fn youtube_video_id(url: &str) -> Option<String> {
    let patterns = [
        r"^https?://(?:www\.)?youtube\.com/watch\?(?:[^#]*&)?v=([A-Za-z0-9_-]{6,})",
        r"^https?://youtu\.be/([A-Za-z0-9_-]{6,})",
        r"^https?://(?:www\.)?youtube\.com/embed/([A-Za-z0-9_-]{6,})",
        r"^https?://(?:www\.)?youtube\.com/shorts/([A-Za-z0-9_-]{6,})",
    ];
    for pattern in patterns {
        let re = Regex::new(pattern).unwrap();
        if let Some(caps) = re.captures(url) {
            return Some(caps[1].to_string());
        }
    }
    None
}

/// Email clients collapse empty paragraphs; keep the vertical space.
pub fn normalize_empty_paragraphs(html: &str) -> String {
    html.replace("<p></p>", "<p><br></p>")
}

/// Anchor URLs eligible for shortening, in positional order. `None`
/// entries are anchors that must not be rewritten (mailto/tel/unsubscribe).
pub fn extract_anchor_urls(html: &str, unsubscribe_url: &str) -> Vec<Option<String>> {
    anchor_hrefs(html)
        .into_iter()
        .map(|url| {
            if is_shortenable(&url, unsubscribe_url) {
                Some(url)
            } else {
                None
            }
        })
        .collect()
}

fn anchor_hrefs(html: &str) -> Vec<String> {
    let re = Regex::new(r#"<a\s[^>]*href="([^"]+)""#).unwrap();
    re.captures_iter(html).map(|c| c[1].to_string()).collect()
}

fn is_shortenable(url: &str, unsubscribe_url: &str) -> bool {
    if url.starts_with("mailto:") || url.starts_with("tel:") {
        return false;
    }
    if !unsubscribe_url.is_empty() && url == unsubscribe_url {
        return false;
    }
    if url.contains("/api/newsletter/unsubscribe/") || url == BROADCAST_UNSUBSCRIBE_PLACEHOLDER {
        return false;
    }
    url.starts_with("http://") || url.starts_with("https://")
}

/// Replace each anchor's href with the positionally matching replacement.
/// Two anchors with identical hrefs receive their own entries, so per-URL
/// occurrence counting falls out of the walk order.
pub fn replace_anchor_urls(html: &str, replacements: &[Option<String>]) -> String {
    let re = Regex::new(r#"(<a\s[^>]*href=")([^"]+)(")"#).unwrap();
    let mut index = 0;
    re.replace_all(html, |caps: &regex::Captures| {
        let replacement = replacements.get(index).cloned().flatten();
        index += 1;
        match replacement {
            Some(url) => format!("{}{}{}", &caps[1], url, &caps[3]),
            None => caps[0].to_string(),
        }
    })
    .into_owned()
}

/// Allocate short codes for every shortenable anchor and rewrite the HTML.
async fn shorten_links(
    pool: &PgPool,
    html: &str,
    scope: ShortenScope,
    short_base: &str,
    unsubscribe_url: &str,
) -> anyhow::Result<String> {
    let urls = extract_anchor_urls(html, unsubscribe_url);
    if urls.iter().all(Option::is_none) {
        return Ok(html.to_string());
    }

    let (campaign_id, step_id) = match scope {
        ShortenScope::Campaign(id) => (Some(id), None),
        ShortenScope::SequenceStep(id) => (None, Some(id)),
    };

    let mut replacements: Vec<Option<String>> = Vec::with_capacity(urls.len());
    let mut position: i32 = 0;
    for url in &urls {
        match url {
            Some(url) => {
                position += 1;
                let code = allocate_short_code(pool, url, position, campaign_id, step_id).await?;
                replacements.push(Some(format!("{}/{}", short_base, code)));
            }
            None => replacements.push(None),
        }
    }

    Ok(replace_anchor_urls(html, &replacements))
}

/// Insert a fresh short code, retrying up to 3 times on collision.
async fn allocate_short_code(
    pool: &PgPool,
    original_url: &str,
    position: i32,
    campaign_id: Option<Uuid>,
    step_id: Option<Uuid>,
) -> anyhow::Result<String> {
    for _ in 0..3 {
        let code = generate_short_code();
        let inserted = sqlx::query(
            r#"
            INSERT INTO short_urls (id, short_code, original_url, position, campaign_id, sequence_step_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (short_code) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&code)
        .bind(original_url)
        .bind(position)
        .bind(campaign_id)
        .bind(step_id)
        .execute(pool)
        .await?
        .rows_affected();
        if inserted == 1 {
            return Ok(code);
        }
    }
    anyhow::bail!("short code allocation failed after 3 collisions")
}

/// Wrap rendered content in a preset layout. Unknown template ids fall
/// back to `simple`.
pub fn wrap_preset(
    template_id: &str,
    subject: &str,
    content_html: &str,
    brand: &BrandSettings,
    unsubscribe_url: &str,
    site_url: &str,
) -> String {
    match template_id {
        "minimal" => wrap_minimal(subject, content_html, brand, unsubscribe_url),
        "featured" => wrap_featured(subject, content_html, brand, unsubscribe_url, site_url),
        _ => wrap_simple(subject, content_html, brand, unsubscribe_url),
    }
}

fn footer_block(brand: &BrandSettings, unsubscribe_url: &str) -> String {
    let signature = brand
        .email_signature
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(|s| format!("<p>{}</p>", s))
        .unwrap_or_default();
    format!(
        r#"<div style="text-align: center; padding: 20px; font-size: 12px; color: #666;">
            {signature}
            <p>{footer}</p>
            <p><a href="{unsubscribe_url}" style="color: #666;">Unsubscribe</a></p>
        </div>"#,
        signature = signature,
        footer = brand.footer_text,
        unsubscribe_url = unsubscribe_url,
    )
}

fn wrap_simple(
    subject: &str,
    content_html: &str,
    brand: &BrandSettings,
    unsubscribe_url: &str,
) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>{subject}</title>
</head>
<body style="margin: 0; font-family: Arial, sans-serif; line-height: 1.6; color: #333; background-color: {secondary};">
    <div style="max-width: 600px; margin: 0 auto; padding: 20px;">
        <div style="background-color: {primary}; color: white; padding: 20px; text-align: center;">
            <h1 style="margin: 0; font-size: 22px;">{subject}</h1>
        </div>
        <div style="padding: 24px; background-color: #ffffff;">
            {content}
        </div>
        {footer}
    </div>
</body>
</html>"#,
        subject = subject,
        primary = brand.primary_color,
        secondary = brand.secondary_color,
        content = content_html,
        footer = footer_block(brand, unsubscribe_url),
    )
}

fn wrap_minimal(
    subject: &str,
    content_html: &str,
    brand: &BrandSettings,
    unsubscribe_url: &str,
) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>{subject}</title>
</head>
<body style="margin: 0; font-family: Arial, sans-serif; line-height: 1.6; color: #333;">
    <div style="max-width: 600px; margin: 0 auto; padding: 24px;">
        {content}
        {footer}
    </div>
</body>
</html>"#,
        subject = subject,
        content = content_html,
        footer = footer_block(brand, unsubscribe_url),
    )
}

fn wrap_featured(
    subject: &str,
    content_html: &str,
    brand: &BrandSettings,
    unsubscribe_url: &str,
    site_url: &str,
) -> String {
    let logo = brand
        .logo_url
        .as_deref()
        .filter(|s| !s.is_empty())
        .map(|url| {
            format!(
                r#"<a href="{site_url}"><img src="{url}" alt="logo" style="max-height: 48px;"></a>"#
            )
        })
        .unwrap_or_default();
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>{subject}</title>
</head>
<body style="margin: 0; font-family: Arial, sans-serif; line-height: 1.6; color: #333; background-color: {secondary};">
    <div style="max-width: 600px; margin: 0 auto; padding: 20px;">
        <div style="padding: 16px; text-align: center;">{logo}</div>
        <div style="padding: 24px; background-color: #ffffff; border-top: 4px solid {primary};">
            <h1 style="margin-top: 0; font-size: 24px; color: {primary};">{subject}</h1>
            {content}
        </div>
        {footer}
    </div>
</body>
</html>"#,
        subject = subject,
        primary = brand.primary_color,
        secondary = brand.secondary_color,
        logo = logo,
        content = content_html,
        footer = footer_block(brand, unsubscribe_url),
    )
}

/// Known preset ids, surfaced by the templates API.
pub fn preset_ids() -> &'static [&'static str] {
    &["simple", "minimal", "featured"]
}

/// Template id resolution order: explicit → brand default → simple.
pub fn resolve_template_id(explicit: Option<&str>, brand: &BrandSettings) -> String {
    explicit
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| {
            if brand.default_template_id.is_empty() {
                "simple".to_string()
            } else {
                brand.default_template_id.clone()
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn brand() -> BrandSettings {
        BrandSettings::default()
    }

    #[test]
    fn replaces_name_tokens_including_legacy_form() {
        let out = replace_variables(
            "Hi {{name}}, aka {{subscriber.name}}",
            Some("Ada"),
            "https://example.com/u/tok",
            "#1a73e8",
        );
        assert_eq!(out, "Hi Ada, aka Ada");
    }

    #[test]
    fn missing_name_becomes_empty_string() {
        let out = replace_variables("Hi {{name}}!", None, "", "#000");
        assert_eq!(out, "Hi !");
    }

    #[test]
    fn unsubscribe_token_becomes_brand_colored_anchor() {
        let out = replace_variables("{{unsubscribe_url}}", None, "https://x.test/u/t1", "#ff0000");
        assert!(out.contains("href=\"https://x.test/u/t1\""));
        assert!(out.contains("color: #ff0000"));
    }

    #[test]
    fn replace_variables_is_idempotent_without_tokens() {
        let content = "<p>No tokens here.</p>";
        let once = replace_variables(content, Some("Ada"), "https://u.test", "#000");
        let twice = replace_variables(&once, Some("Ada"), "https://u.test", "#000");
        assert_eq!(once, twice);
    }

    #[test]
    fn plain_text_is_detected_as_markdown() {
        assert!(looks_like_markdown("# Hello\n\nSome *markdown* text."));
        assert!(!looks_like_markdown("<p>Already HTML</p>"));
    }

    #[test]
    fn markdown_is_converted_to_html() {
        let html = markdown_to_html("# Title\n\nBody");
        assert!(html.contains("<h1>Title</h1>"));
        assert!(html.contains("<p>Body</p>"));
    }

    #[test]
    fn bare_urls_become_anchors() {
        let out = linkify("<p>See https://example.com/page for more</p>");
        assert!(out.contains("<a href=\"https://example.com/page\">https://example.com/page</a>"));
    }

    #[test]
    fn urls_inside_href_are_untouched() {
        let html = r#"<a href="https://example.com">link</a>"#;
        assert_eq!(linkify(html), html);
    }

    #[test]
    fn urls_inside_anchor_bodies_are_untouched() {
        let html = r#"<a href="https://example.com">https://example.com</a>"#;
        assert_eq!(linkify(html), html);
    }

    #[test]
    fn youtube_watch_urls_become_thumbnails() {
        let out = linkify("<p>https://www.youtube.com/watch?v=dQw4w9WgXcQ</p>");
        assert!(out.contains("img.youtube.com/vi/dQw4w9WgXcQ/maxresdefault.jpg"));
        assert!(out.contains("<a href=\"https://www.youtube.com/watch?v=dQw4w9WgXcQ\">"));
    }

    #[test]
    fn youtube_id_extraction_covers_all_forms() {
        assert_eq!(
            youtube_video_id("https://youtu.be/dQw4w9WgXcQ").as_deref(),
            Some("dQw4w9WgXcQ")
        );
        assert_eq!(
            youtube_video_id("https://www.youtube.com/embed/dQw4w9WgXcQ").as_deref(),
            Some("dQw4w9WgXcQ")
        );
        assert_eq!(
            youtube_video_id("https://www.youtube.com/shorts/dQw4w9WgXcQ").as_deref(),
            Some("dQw4w9WgXcQ")
        );
        assert_eq!(youtube_video_id("https://example.com/watch?v=x"), None);
    }

    #[test]
    fn empty_paragraphs_gain_a_break() {
        assert_eq!(
            normalize_empty_paragraphs("<p>a</p><p></p><p>b</p>"),
            "<p>a</p><p><br></p><p>b</p>"
        );
    }

    #[test]
    fn anchor_extraction_skips_mailto_tel_and_unsubscribe() {
        let html = concat!(
            r#"<a href="https://a.test">a</a>"#,
            r#"<a href="mailto:x@y.test">mail</a>"#,
            r#"<a href="tel:+8100000000">tel</a>"#,
            r#"<a href="https://site.test/api/newsletter/unsubscribe/tok">bye</a>"#,
            r#"<a href="https://b.test">b</a>"#,
        );
        let urls = extract_anchor_urls(html, "");
        assert_eq!(urls.len(), 5);
        assert_eq!(urls[0].as_deref(), Some("https://a.test"));
        assert!(urls[1].is_none());
        assert!(urls[2].is_none());
        assert!(urls[3].is_none());
        assert_eq!(urls[4].as_deref(), Some("https://b.test"));
    }

    #[test]
    fn duplicate_hrefs_are_rewritten_independently() {
        let html = r#"<p><a href="https://x.example">one</a> and <a href="https://x.example">two</a></p>"#;
        let replacements = vec![
            Some("https://s.test/code0001".to_string()),
            Some("https://s.test/code0002".to_string()),
        ];
        let out = replace_anchor_urls(html, &replacements);
        assert!(out.contains(r#"<a href="https://s.test/code0001">one</a>"#));
        assert!(out.contains(r#"<a href="https://s.test/code0002">two</a>"#));
        assert!(!out.contains("https://x.example"));
    }

    #[test]
    fn skipped_anchors_keep_their_href() {
        let html = r#"<a href="mailto:a@b.c">m</a><a href="https://x.test">x</a>"#;
        let out = replace_anchor_urls(html, &[None, Some("https://s.test/abcd1234".to_string())]);
        assert!(out.contains(r#"href="mailto:a@b.c""#));
        assert!(out.contains(r#"href="https://s.test/abcd1234""#));
    }

    #[test]
    fn wrap_simple_contains_brand_and_content() {
        let html = wrap_preset(
            "simple",
            "Weekly News",
            "<p>Body</p>",
            &brand(),
            "https://x.test/u/t",
            "https://x.test",
        );
        assert!(html.starts_with("<!DOCTYPE html>"));
        assert!(html.contains("Weekly News"));
        assert!(html.contains("<p>Body</p>"));
        assert!(html.contains(&brand().primary_color));
        assert!(html.contains("https://x.test/u/t"));
    }

    #[test]
    fn unknown_template_falls_back_to_simple() {
        let a = wrap_preset("simple", "S", "<p>c</p>", &brand(), "u", "s");
        let b = wrap_preset("no-such-preset", "S", "<p>c</p>", &brand(), "u", "s");
        assert_eq!(a, b);
    }

    #[test]
    fn rendering_is_deterministic_for_fixed_inputs() {
        let html = "<p>Hello {{name}} https://example.com</p>";
        let render = |content: &str| {
            let substituted = replace_variables(content, Some("Ada"), "https://u.test", "#000");
            let linked = linkify(&substituted);
            wrap_preset("simple", "S", &linked, &brand(), "https://u.test", "https://x.test")
        };
        assert_eq!(render(html), render(html));
    }

    #[test]
    fn template_resolution_prefers_explicit_then_brand_default() {
        let mut b = brand();
        b.default_template_id = "featured".to_string();
        assert_eq!(resolve_template_id(Some("minimal"), &b), "minimal");
        assert_eq!(resolve_template_id(None, &b), "featured");
        b.default_template_id = String::new();
        assert_eq!(resolve_template_id(None, &b), "simple");
    }

    #[test]
    fn broadcast_placeholder_is_not_shortened() {
        let html = format!(r#"<a href="{}">stop</a>"#, BROADCAST_UNSUBSCRIBE_PLACEHOLDER);
        let urls = extract_anchor_urls(&html, BROADCAST_UNSUBSCRIBE_PLACEHOLDER);
        assert_eq!(urls, vec![None]);
    }
}
