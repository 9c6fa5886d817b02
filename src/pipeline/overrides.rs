use std::collections::BTreeMap;

use hook_plugin::message::{RequestObject, ReturnOverride};

use super::HookResponse;
use crate::driver::HookExecutionError;

const DEFAULT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/// The override a hook asked for, if any. A code, a body or an error
/// triggers it; headers on their own do not.
pub fn check(request: &RequestObject) -> Option<ReturnOverride> {
    let ov = &request.return_overrides;
    if ov.response_code.is_some() || ov.response_body.is_some() || ov.response_error.is_some() {
        Some(ov.clone())
    } else {
        None
    }
}

/// Response for an override, verbatim.
pub fn render(ov: &ReturnOverride) -> Result<HookResponse, HookExecutionError> {
    let code = ov.response_code.unwrap_or(200);
    let status = u16::try_from(code)
        .ok()
        .filter(|c| (100..=599).contains(c))
        .ok_or_else(|| HookExecutionError::InvalidReply(format!("response code {code} is not a valid HTTP status")))?;

    let mut headers = BTreeMap::from([("content-type".to_string(), DEFAULT_CONTENT_TYPE.to_string())]);
    for (k, v) in ov.response_headers.iter().flatten() {
        headers.insert(k.to_ascii_lowercase(), v.clone());
    }

    let body = ov
        .response_body
        .clone()
        .or_else(|| ov.response_error.clone())
        .unwrap_or_default();
    Ok(HookResponse { status, headers, body })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with(ov: ReturnOverride) -> RequestObject {
        RequestObject { return_overrides: ov, ..Default::default() }
    }

    #[test]
    fn unset_fields_do_not_trigger() {
        assert!(check(&RequestObject::default()).is_none());
        let headers_only = ReturnOverride {
            response_headers: Some(BTreeMap::from([("x".into(), "y".into())])),
            ..Default::default()
        };
        assert!(check(&with(headers_only)).is_none());
    }

    #[test]
    fn empty_string_body_still_triggers() {
        let ov = ReturnOverride { response_body: Some(String::new()), ..Default::default() };
        let found = check(&with(ov)).unwrap();
        let rsp = render(&found).unwrap();
        assert_eq!(rsp.status, 200);
        assert_eq!(rsp.body, "");
    }

    #[test]
    fn renders_code_body_and_merged_headers() {
        let ov = ReturnOverride {
            response_code: Some(418),
            response_error: Some("teapot".into()),
            response_body: Some("short and stout".into()),
            response_headers: Some(BTreeMap::from([
                ("Content-Type".into(), "application/json".into()),
                ("X-Reason".into(), "brewing".into()),
            ])),
        };
        let rsp = render(&ov).unwrap();
        assert_eq!(rsp.status, 418);
        assert_eq!(rsp.body, "short and stout");
        assert_eq!(rsp.headers["content-type"], "application/json");
        assert_eq!(rsp.headers["x-reason"], "brewing");
    }

    #[test]
    fn error_is_the_body_when_no_body_is_given() {
        let ov = ReturnOverride { response_code: Some(401), response_error: Some("denied".into()), ..Default::default() };
        let rsp = render(&ov).unwrap();
        assert_eq!((rsp.status, rsp.body.as_str()), (401, "denied"));
        assert_eq!(rsp.headers["content-type"], DEFAULT_CONTENT_TYPE);
    }

    #[test]
    fn out_of_range_codes_are_invalid() {
        for code in [0, 99, 600, -1] {
            let ov = ReturnOverride { response_code: Some(code), ..Default::default() };
            assert!(matches!(render(&ov), Err(HookExecutionError::InvalidReply(_))), "{code}");
        }
    }
}
