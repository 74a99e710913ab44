// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[yare::parameterized(
    no_token = { ErrorCode::NoToken, 401, "NO_TOKEN" },
    token_expired = { ErrorCode::TokenExpired, 401, "TOKEN_EXPIRED" },
    refresh_failed = { ErrorCode::RefreshFailed, 503, "REFRESH_FAILED" },
    bad_request = { ErrorCode::BadRequest, 400, "BAD_REQUEST" },
    upstream = { ErrorCode::UpstreamError, 502, "UPSTREAM_ERROR" },
    internal = { ErrorCode::Internal, 500, "INTERNAL" },
)]
fn status_and_code(code: ErrorCode, status: u16, name: &str) {
    assert_eq!(code.http_status(), status);
    assert_eq!(code.as_str(), name);
    assert_eq!(code.to_string(), name);
}

#[test]
fn http_response_wraps_body() {
    let (status, body) = ErrorCode::TokenExpired.to_http_response("expired 3 minutes ago");
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body.0.error.code, "TOKEN_EXPIRED");
    assert_eq!(body.0.error.message, "expired 3 minutes ago");
}
