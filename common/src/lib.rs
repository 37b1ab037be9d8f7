use std::net::IpAddr;

use axum::{Json, http::HeaderMap, response::IntoResponse};
use http::StatusCode;
use owo_colors::OwoColorize;
use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize};

pub mod args;
pub mod cors;
pub mod metrics;
mod request_context;
pub mod shutdown;
pub mod wait;

pub use request_context::*;

pub fn signal_ready() {
    std::fs::write("/etc/ready", "ready").expect("Failed to write readiness file");
}

/// Labels stamped onto every namespace and pod this control plane owns.
pub mod labels {
    pub const APP: &str = "app";
    pub const APP_VALUE: &str = "agentbox";
    pub const ENV_ID: &str = "agentbox.dev/environment-id";
    pub const EXEC_ID: &str = "agentbox.dev/execution-id";
    pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
    pub const MANAGED_BY_VALUE: &str = "agentbox";
}

pub fn init() {
    let disable_colors = ["1", "true"].contains(
        &std::env::var("DISABLE_COLORS")
            .unwrap_or_else(|_| String::new())
            .to_lowercase()
            .as_str(),
    );
    owo_colors::set_override(!disable_colors);
}

/// List pagination query parameters. Both fields tolerate string-encoded
/// integers because query params and JSON bodies feed the same structs.
#[derive(Deserialize, Default, Clone, Debug)]
pub struct Pagination {
    #[serde(default, deserialize_with = "deserialize_opt_i64_from_string_or_int")]
    pub offset: Option<i64>,

    #[serde(default, deserialize_with = "deserialize_opt_i64_from_string_or_int")]
    pub limit: Option<i64>,
}

pub const DEFAULT_PAGE_LIMIT: i64 = 100;
pub const MAX_PAGE_LIMIT: i64 = 1000;

impl Pagination {
    /// Effective limit: default 100, hard cap 1000, negative values fall
    /// back to the default.
    pub fn limit(&self) -> usize {
        match self.limit {
            Some(l) if l > 0 => l.min(MAX_PAGE_LIMIT) as usize,
            _ => DEFAULT_PAGE_LIMIT as usize,
        }
    }

    /// Effective offset: default 0, negative values clamp to 0.
    pub fn offset(&self) -> usize {
        self.offset.filter(|o| *o > 0).unwrap_or(0) as usize
    }
}

fn deserialize_opt_i64_from_string_or_int<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    struct OptI64Visitor;

    impl<'de> Visitor<'de> for OptI64Visitor {
        type Value = Option<i64>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("an optional integer or a string containing an integer")
        }

        fn visit_none<E>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E> {
            Ok(None)
        }

        fn visit_some<D2>(self, deserializer: D2) -> Result<Self::Value, D2::Error>
        where
            D2: Deserializer<'de>,
        {
            deserializer.deserialize_any(OptI64Visitor)
        }

        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E> {
            Ok(Some(v))
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Some(
                i64::try_from(v).map_err(|_| E::custom("integer out of range"))?,
            ))
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                return Ok(None);
            }
            trimmed
                .parse::<i64>()
                .map(Some)
                .map_err(|e| E::custom(format!("invalid integer: {e}")))
        }

        fn visit_string<E>(self, v: String) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            self.visit_str(&v)
        }
    }

    deserializer.deserialize_any(OptI64Visitor)
}

/// JSON error envelope shared by every API error response.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ErrorBody {
    pub error: String,
    pub message: String,
    pub code: u16,
}

pub mod response {
    use std::fmt::{Debug, Display};

    use anyhow::Error;
    use axum::response::Response;

    use super::*;

    pub fn print_error<T>(e: T)
    where
        T: Into<Error> + Display + Debug,
    {
        eprintln!(
            "❌ {}",
            format!("{:?}", e.into())
                .split("\n")
                .map(|s| s.red().to_string())
                .collect::<Vec<_>>()
                .join("\n"),
        );
    }

    pub fn print_warning<T>(e: T)
    where
        T: Into<Error> + Display + Debug,
    {
        eprintln!(
            "⚠️ {}",
            format!("{:?}", e.into())
                .split("\n")
                .map(|s| s.yellow().to_string())
                .collect::<Vec<_>>()
                .join("\n"),
        );
    }

    fn short_reason(code: StatusCode) -> String {
        code.canonical_reason()
            .unwrap_or("error")
            .to_lowercase()
            .replace(' ', "_")
    }

    /// Build the `{error, message, code}` envelope. Server-side errors are
    /// logged in full but the client only sees a generic message.
    pub fn err_resp<T>(e: T, code: StatusCode) -> Response
    where
        T: Into<Error> + Display + Debug,
    {
        let message = if code.is_server_error() {
            print_error(e);
            "internal error".to_string()
        } else {
            format!("{}", e)
        };
        let body = ErrorBody {
            error: short_reason(code),
            message,
            code: code.as_u16(),
        };
        (code, Json(body)).into_response()
    }

    pub fn bad_request<T>(e: T) -> Response
    where
        T: Into<Error> + Display + Debug,
    {
        err_resp(e, StatusCode::BAD_REQUEST)
    }

    pub fn unauthorized<T>(e: T) -> Response
    where
        T: Into<Error> + Display + Debug,
    {
        err_resp(e, StatusCode::UNAUTHORIZED)
    }

    pub fn forbidden<T>(e: T) -> Response
    where
        T: Into<Error> + Display + Debug,
    {
        err_resp(e, StatusCode::FORBIDDEN)
    }

    pub fn not_found<T>(e: T) -> Response
    where
        T: Into<Error> + Display + Debug,
    {
        err_resp(e, StatusCode::NOT_FOUND)
    }

    pub fn conflict<T>(e: T) -> Response
    where
        T: Into<Error> + Display + Debug,
    {
        err_resp(e, StatusCode::CONFLICT)
    }

    pub fn internal_server_error<T>(e: T) -> Response
    where
        T: Into<Error> + Display + Debug,
    {
        err_resp(e, StatusCode::INTERNAL_SERVER_ERROR)
    }

    pub fn error<T>(e: T) -> Response
    where
        T: Into<Error> + Display + Debug,
    {
        internal_server_error(e)
    }

    pub fn service_unavailable<T>(e: T) -> Response
    where
        T: Into<Error> + Display + Debug,
    {
        err_resp(e, StatusCode::SERVICE_UNAVAILABLE)
    }
}

pub mod access_log {
    use super::*;

    pub async fn public(
        req: axum::extract::Request,
        next: axum::middleware::Next,
    ) -> axum::response::Response {
        request("API", req, next, false).await
    }

    pub async fn public_error_only(
        req: axum::extract::Request,
        next: axum::middleware::Next,
    ) -> axum::response::Response {
        request("API", req, next, true).await
    }

    pub async fn request(
        prefix: &str,
        req: axum::extract::Request,
        next: axum::middleware::Next,
        errors_only: bool,
    ) -> axum::response::Response {
        let ip = get_source_ip(req.headers())
            .map(|ip| ip.to_string())
            .unwrap_or("unknown".into());
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let start = std::time::Instant::now();
        let response = next.run(req).await;
        let duration = start.elapsed();
        let is_success =
            response.status().is_success() || response.status() == StatusCode::SWITCHING_PROTOCOLS;
        if is_success && errors_only {
            return response; // Skip non-error logs
        }
        let (a, b) = if is_success {
            // Note that 101 Switching Protocols is used for WebSocket upgrades
            ((20, 163, 73), (25, 163, 118))
        } else {
            ((230, 126, 16), (171, 85, 17))
        };
        println!(
            "🧾 {} {} {} {} {} {}{}{} {}{}",
            format!("[{}]", prefix).truecolor(a.0, a.1, a.2),
            method.truecolor(b.0, b.1, b.2),
            path.truecolor(b.0, b.1, b.2),
            "→".truecolor(a.0, a.1, a.2),
            response.status().truecolor(b.0, b.1, b.2),
            "(".truecolor(a.0, a.1, a.2),
            format!("{:?}", duration).truecolor(b.0, b.1, b.2),
            ")".truecolor(a.0, a.1, a.2),
            "xff=".magenta(),
            ip.magenta().dimmed(),
        );
        response
    }
}

pub fn get_source_ip(headers: &HeaderMap) -> Option<IpAddr> {
    // Prefer X-Forwarded-For (may contain multiple)
    if let Some(forwarded_for) = headers.get("x-forwarded-for")
        && let Ok(forwarded_for) = forwarded_for.to_str()
        && let Some(ip_str) = forwarded_for.split(',').next()
        && let Ok(ip) = ip_str.trim().parse()
    {
        return Some(ip);
    }

    // Fallback to X-Real-IP
    if let Some(real_ip) = headers.get("x-real-ip")
        && let Ok(ip_str) = real_ip.to_str()
        && let Ok(ip) = ip_str.trim().parse()
    {
        return Some(ip);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(limit: Option<i64>, offset: Option<i64>) -> Pagination {
        Pagination { limit, offset }
    }

    #[test]
    fn pagination_defaults() {
        let p = page(None, None);
        assert_eq!(p.limit(), 100);
        assert_eq!(p.offset(), 0);
    }

    #[test]
    fn pagination_caps_and_clamps() {
        assert_eq!(page(Some(999_999), None).limit(), 1000);
        assert_eq!(page(Some(-5), None).limit(), 100);
        assert_eq!(page(None, Some(-3)).offset(), 0);
        assert_eq!(page(Some(2), Some(4)).offset(), 4);
    }

    #[test]
    fn pagination_accepts_string_params() {
        let p: Pagination = serde_json::from_str(r#"{"limit":"25","offset":"10"}"#).unwrap();
        assert_eq!(p.limit(), 25);
        assert_eq!(p.offset(), 10);
    }
}
