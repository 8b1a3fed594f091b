use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use http::header::{HeaderName, HeaderValue, RETRY_AFTER};
use http::HeaderMap;
use tokio::time::Instant;

use crate::error::Error;

pub(crate) const RATE_LIMIT_RESET_AFTER_HEADER: &str = "x-ratelimit-reset-after";

const MAX_ERROR_BODY_LEN: usize = 2048;
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 86_400);

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|raw| raw.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

pub(crate) fn parse_seconds(raw: &str) -> Option<Duration> {
    let seconds = raw.trim().parse::<f64>().ok()?;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(seconds).ok()
}

pub(crate) fn parse_retry_after(headers: &HeaderMap, now: SystemTime) -> Option<Duration> {
    if let Some(delay) = header_str(headers, RATE_LIMIT_RESET_AFTER_HEADER).and_then(parse_seconds)
    {
        return Some(delay);
    }

    let raw_value = header_str(headers, RETRY_AFTER.as_str())?;
    if let Some(delay) = parse_seconds(raw_value) {
        return Some(delay);
    }

    let date = httpdate::parse_http_date(raw_value).ok()?;
    match date.duration_since(now) {
        Ok(duration) => Some(duration),
        Err(_) => Some(Duration::ZERO),
    }
}

pub(crate) fn redact_uri_for_logs(uri_text: &str) -> String {
    let Ok(mut parsed) = url::Url::parse(uri_text) else {
        return uri_text.split('?').next().unwrap_or(uri_text).to_owned();
    };

    let _ = parsed.set_username("");
    let _ = parsed.set_password(None);
    parsed.set_query(None);
    parsed.set_fragment(None);

    let mut path_segments = parsed
        .path_segments()
        .map(|segments| segments.map(ToOwned::to_owned).collect::<Vec<_>>())
        .unwrap_or_default();
    if !path_segments.is_empty() {
        for index in 0..path_segments.len() {
            let segment = &path_segments[index];
            if let Some(rest) = segment.strip_prefix("bot")
                && !rest.is_empty()
                && rest.contains(':')
            {
                path_segments[index] = "bot<redacted>".to_owned();
                continue;
            }
            // Webhook and interaction tokens sit right after their id segment.
            if (segment == "webhooks" || segment == "interactions")
                && let Some(token) = path_segments.get_mut(index + 2)
            {
                *token = "<redacted>".to_owned();
            }
        }

        let has_trailing_slash = parsed.path().ends_with('/');
        let mut rebuilt_path = String::new();
        for segment in &path_segments {
            rebuilt_path.push('/');
            rebuilt_path.push_str(segment);
        }
        if rebuilt_path.is_empty() || (has_trailing_slash && !rebuilt_path.ends_with('/')) {
            rebuilt_path.push('/');
        }
        parsed.set_path(&rebuilt_path);
    }

    parsed.to_string()
}

pub(crate) fn append_query_pairs(url_text: &str, query_pairs: &[(String, Option<String>)]) -> String {
    let present = query_pairs
        .iter()
        .filter_map(|(name, value)| value.as_ref().map(|value| (name.as_str(), value.as_str())))
        .collect::<Vec<_>>();
    if present.is_empty() {
        return url_text.to_owned();
    }

    if let Ok(mut url) = url::Url::parse(url_text) {
        let existing = url
            .query()
            .map(|query| {
                url::form_urlencoded::parse(query.as_bytes())
                    .map(|(name, value)| (name.into_owned(), value.into_owned()))
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        let query = build_query_string(&existing, &present);
        url.set_query(Some(&query));
        return url.to_string();
    }

    let (without_fragment, fragment) = match url_text.split_once('#') {
        Some((left, right)) => (left, Some(right)),
        None => (url_text, None),
    };
    let (base, existing_query) = match without_fragment.split_once('?') {
        Some((left, right)) => (left, Some(right)),
        None => (without_fragment, None),
    };
    let existing = existing_query
        .map(|query| {
            url::form_urlencoded::parse(query.as_bytes())
                .map(|(name, value)| (name.into_owned(), value.into_owned()))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    let query = build_query_string(&existing, &present);

    let mut merged = format!("{base}?{query}");
    if let Some(fragment) = fragment {
        merged.push('#');
        merged.push_str(fragment);
    }
    merged
}

fn build_query_string(existing: &[(String, String)], appended: &[(&str, &str)]) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (name, value) in existing {
        serializer.append_pair(name, value);
    }
    for (name, value) in appended {
        serializer.append_pair(name, value);
    }
    serializer.finish()
}

pub(crate) fn parse_header_name(name: &str) -> Result<HeaderName, Error> {
    name.parse()
        .map_err(|source| Error::InvalidHeaderName {
            name: name.to_owned(),
            source,
        })
}

pub(crate) fn parse_header_value(name: &str, value: &str) -> Result<HeaderValue, Error> {
    value
        .parse()
        .map_err(|source| Error::InvalidHeaderValue {
            name: name.to_owned(),
            source,
        })
}

pub(crate) fn instant_after(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

pub(crate) fn remaining_until(deadline: Option<Instant>, now: Instant) -> Option<Option<Duration>> {
    match deadline {
        None => Some(None),
        Some(deadline) if now >= deadline => None,
        Some(deadline) => Some(Some(deadline - now)),
    }
}

pub(crate) fn truncate_body(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    if text.chars().count() <= MAX_ERROR_BODY_LEN {
        return text.into_owned();
    }

    let truncated: String = text.chars().take(MAX_ERROR_BODY_LEN).collect();
    format!("{truncated}...(truncated)")
}
