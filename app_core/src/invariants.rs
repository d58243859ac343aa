use crate::contracts::EngineError;

/// # NDOC
/// component: `app_core::invariants`
/// purpose: Shared invariant checks used by multiple subsystems.
/// invariants:
///   - Validation helpers must return `EngineError::validation` for caller-safe failures.
///   - Helpers must not perform I/O or mutate external state.
pub fn ensure_non_empty_trimmed(value: &str, field: &str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::validation(format!(
            "'{}' cannot be empty",
            field
        )));
    }
    Ok(())
}

/// # NDOC
/// component: `app_core::invariants`
/// purpose: Enforce an inclusive numeric bound with a user-safe error.
pub fn ensure_range_usize(
    value: usize,
    min: usize,
    max: usize,
    name: &str,
) -> Result<(), EngineError> {
    if value < min || value > max {
        return Err(EngineError::validation(format!(
            "'{}' must be in range {}..={}",
            name, min, max
        )));
    }
    Ok(())
}

/// # NDOC
/// component: `app_core::invariants`
/// purpose: Ensure a target URL is absolute http(s) before any session work starts.
pub fn ensure_http_url(raw: &str, field: &str) -> Result<url::Url, EngineError> {
    let parsed = url::Url::parse(raw.trim()).map_err(|e| {
        EngineError::validation(format!("'{}' is not a valid URL: {}", field, e))
    })?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(EngineError::validation(format!(
            "'{}' must be http or https, got '{}'",
            field, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_trimmed_string() {
        let err = ensure_non_empty_trimmed("   ", "job_url").expect_err("must fail");
        assert!(err.message.contains("job_url"));
    }

    #[test]
    fn validates_usize_range() {
        assert!(ensure_range_usize(5, 1, 10, "job_urls.len").is_ok());
        assert!(ensure_range_usize(11, 1, 10, "job_urls.len").is_err());
    }

    #[test]
    fn validates_url_scheme() {
        assert!(ensure_http_url("https://jobs.example.com/apply/1", "job_url").is_ok());
        assert!(ensure_http_url("ftp://example.com", "job_url").is_err());
        assert!(ensure_http_url("not a url", "job_url").is_err());
    }
}
