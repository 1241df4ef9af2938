//! 认证信息提取与令牌声明投影
//!
//! 与 Web 框架无关；axum 层只负责把头部与查询串交给这里。

use crate::context::{lookup_managed_key, CallContext};
use crate::error::{Error, Result};
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use serde_json::{Map, Value};

const BASIC_PREFIX: &str = "basic ";
const BEARER_PREFIX: &str = "bearer ";
const REALM_MARKER: &str = "realms/";

/// 已映射到固定字段的声明，不再参与受管理键的别名匹配
const CANONICAL_CLAIMS: [&str; 6] = [
    "sub",
    "iss",
    "preferred_username",
    "name",
    "email",
    "realm_access",
];

/// 白名单主机设置
#[derive(Debug, Clone, Default)]
pub struct WhitelistSettings {
    pub header: String,
    pub hosts: Vec<String>,
}

impl WhitelistSettings {
    pub fn new(header: impl Into<String>, hosts: Vec<String>) -> Self {
        Self {
            header: header.into(),
            hosts,
        }
    }

    /// 头部取值与白名单比较时忽略大小写
    pub fn matches(&self, host: &str) -> bool {
        let host = host.trim();
        !host.is_empty() && self.hosts.iter().any(|h| h.eq_ignore_ascii_case(host))
    }
}

/// 处理 `Authorization` 头部
///
/// `Basic` 解码后把用户名放入上下文；`Bearer` 把原始令牌放入上下文。其他形式忽略。
pub fn apply_authorization(ctx: &CallContext, authorization: Option<&str>) -> Result<CallContext> {
    let Some(value) = authorization.map(str::trim) else {
        return Ok(ctx.clone());
    };
    if let Some(encoded) = strip_prefix_ignore_case(value, BASIC_PREFIX) {
        let decoded = STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::Claims(format!("invalid basic credentials: {e}")))?;
        let decoded = String::from_utf8(decoded)
            .map_err(|e| Error::Claims(format!("invalid basic credentials: {e}")))?;
        let username = decoded.split_once(':').map_or(decoded.as_str(), |(user, _)| user);
        return Ok(ctx.with_username(username));
    }
    if let Some(token) = strip_prefix_ignore_case(value, BEARER_PREFIX) {
        return Ok(ctx.with_token(token.trim()));
    }
    Ok(ctx.clone())
}

fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    let head = value.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix)
        .then(|| &value[prefix.len()..])
}

/// 解码令牌中间段为声明表
pub fn decode_token(token: &str) -> Result<Map<String, Value>> {
    let mut segments = token.split('.');
    let payload = match (segments.next(), segments.next(), segments.next()) {
        (Some(_), Some(payload), Some(_)) => payload,
        _ => return Err(Error::Claims("token is not a three-segment JWT".into())),
    };
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| Error::Claims(format!("invalid token payload encoding: {e}")))?;
    match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(Error::Claims("token payload is not a JSON object".into())),
        Err(e) => Err(Error::Claims(format!("invalid token payload: {e}"))),
    }
}

/// 由头部与查询参数生成伪声明
///
/// 头部键转为 snake_case，查询键转为 camelCase；同名时查询参数优先。
pub fn pseudo_claims<'a, H, Q>(headers: H, query: Q) -> Map<String, Value>
where
    H: IntoIterator<Item = (&'a str, &'a str)>,
    Q: IntoIterator<Item = (String, String)>,
{
    let mut claims = Map::new();
    for (name, value) in headers {
        claims.insert(snake_case(name), Value::String(value.to_owned()));
    }
    for (name, value) in query {
        claims.insert(camel_case(&name), Value::String(value));
    }
    claims
}

/// 把声明投影到上下文
pub fn project_claims(ctx: &CallContext, claims: &Map<String, Value>) -> CallContext {
    let mut next = ctx.clone();

    if let Some(sub) = claim_str(claims, "sub") {
        next = next.with_user_id(sub);
    }
    if let Some(iss) = claim_str(claims, "iss") {
        let realm = iss
            .find(REALM_MARKER)
            .map_or(iss, |idx| &iss[idx + REALM_MARKER.len()..]);
        next = next.with_realm(realm);
    }
    let username = claim_str(claims, "preferred_username");
    if let Some(username) = username {
        next = next.with_username(username);
    }
    if let Some(full_name) = claim_str(claims, "name").filter(|n| !n.is_empty()).or(username) {
        next = next.with_full_name(full_name);
    }
    if let Some(email) = claim_str(claims, "email") {
        next = next.with_email(email);
    }
    if let Some(roles) = claims
        .get("realm_access")
        .and_then(|access| access.get("roles"))
        .and_then(Value::as_array)
    {
        next = next.with_roles(roles.iter().filter_map(Value::as_str).map(str::to_owned));
    }

    for (name, value) in claims {
        if CANONICAL_CLAIMS.contains(&name.as_str()) {
            continue;
        }
        if let Some(key) = lookup_managed_key(&camel_case(name)) {
            let text = match value {
                Value::String(s) => s.clone(),
                Value::Array(items) => items
                    .iter()
                    .map(|item| item.as_str().map_or_else(|| item.to_string(), str::to_owned))
                    .collect::<Vec<_>>()
                    .join(","),
                other => other.to_string(),
            };
            next = next.with_value(key, text);
        }
    }
    next
}

/// 完整的声明投影
///
/// 白名单主机命中时先并入伪声明；令牌中的同名声明优先。
pub fn project(
    ctx: &CallContext,
    whitelist_host: Option<&str>,
    settings: &WhitelistSettings,
    pseudo: impl FnOnce() -> Map<String, Value>,
) -> Result<CallContext> {
    let mut claims = match ctx.token() {
        Some(token) => decode_token(token)?,
        None => Map::new(),
    };
    if whitelist_host.is_some_and(|host| settings.matches(host)) {
        for (key, value) in pseudo() {
            claims.entry(key).or_insert(value);
        }
    }
    Ok(project_claims(ctx, &claims))
}

fn claim_str<'a>(claims: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    claims.get(key).and_then(Value::as_str)
}

/// `X-Terminal-Id` → `x_terminal_id`，`terminalId` → `terminal_id`
pub fn snake_case(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 4);
    let mut prev_lower = false;
    for ch in input.chars() {
        if ch == '-' || ch == ' ' || ch == '_' {
            if !out.ends_with('_') && !out.is_empty() {
                out.push('_');
            }
            prev_lower = false;
        } else if ch.is_ascii_uppercase() {
            if prev_lower {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
            prev_lower = false;
        } else {
            out.push(ch);
            prev_lower = ch.is_ascii_lowercase() || ch.is_ascii_digit();
        }
    }
    out
}

/// `terminal_id` / `terminal-id` → `terminalId`
pub fn camel_case(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut upper_next = false;
    for ch in input.chars() {
        if ch == '_' || ch == '-' || ch == ' ' {
            upper_next = !out.is_empty();
        } else if upper_next {
            out.push(ch.to_ascii_uppercase());
            upper_next = false;
        } else if out.is_empty() {
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{register_managed_key, ManagedKey};
    use serde_json::json;

    fn token_with(claims: Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
        format!("{header}.{payload}.signature")
    }

    #[test]
    fn test_basic_and_bearer() {
        let ctx = CallContext::new_root();
        let basic = format!("Basic {}", STANDARD.encode("alice:s3cret"));
        let with_basic = apply_authorization(&ctx, Some(&basic)).unwrap();
        assert_eq!(with_basic.username(), Some("alice"));
        assert_eq!(with_basic.token(), None);

        let with_bearer = apply_authorization(&ctx, Some("bearer abc.def.ghi")).unwrap();
        assert_eq!(with_bearer.token(), Some("abc.def.ghi"));

        assert!(matches!(
            apply_authorization(&ctx, Some("Basic !!!")),
            Err(Error::Claims(_))
        ));
        assert_eq!(apply_authorization(&ctx, None).unwrap(), ctx);
    }

    #[test]
    fn test_canonical_projection() {
        let token = token_with(json!({
            "sub": "u-1",
            "iss": "https://sso.example.com/auth/realms/retail",
            "preferred_username": "alice",
            "name": "",
            "email": "alice@example.com",
            "realm_access": {"roles": ["admin", "viewer"]}
        }));
        let ctx = CallContext::new_root().with_token(&token);
        let projected = project(&ctx, None, &WhitelistSettings::default(), Map::new).unwrap();

        assert_eq!(projected.user_id(), Some("u-1"));
        assert_eq!(projected.realm(), Some("retail"));
        assert_eq!(projected.username(), Some("alice"));
        // name 为空时回退为用户名
        assert_eq!(projected.full_name(), Some("alice"));
        assert_eq!(projected.email(), Some("alice@example.com"));
        assert_eq!(projected.roles().unwrap(), ["admin", "viewer"]);
    }

    #[test]
    fn test_managed_key_alias() {
        let key = register_managed_key("branchCode");
        let token = token_with(json!({"sub": "u-1", "branch_code": "B-7", "terminal_id": "T-1"}));
        let ctx = CallContext::new_root().with_token(&token);
        let projected = project(&ctx, None, &WhitelistSettings::default(), Map::new).unwrap();
        assert_eq!(projected.value(key).as_deref(), Some("B-7"));
        assert_eq!(projected.terminal_id(), Some("T-1"));
    }

    #[test]
    fn test_invalid_token_aborts() {
        let ctx = CallContext::new_root().with_token("not-a-jwt");
        assert!(matches!(
            project(&ctx, None, &WhitelistSettings::default(), Map::new),
            Err(Error::Claims(_))
        ));
        let ctx = CallContext::new_root().with_token("a.!!!.c");
        assert!(project(&ctx, None, &WhitelistSettings::default(), Map::new).is_err());
    }

    #[test]
    fn test_whitelisted_host_pseudo_claims() {
        let settings = WhitelistSettings::new("X-Forwarded-Host", vec!["partner.example.com".into()]);
        let pseudo = || {
            pseudo_claims(
                [("Terminal-Id", "T-9"), ("X-Other", "x")],
                [("provider_id".to_string(), "P-3".to_string())],
            )
        };

        let ctx = CallContext::new_root();
        let projected = project(&ctx, Some("Partner.Example.com"), &settings, pseudo).unwrap();
        assert_eq!(projected.terminal_id(), Some("T-9"));
        assert_eq!(projected.value(ManagedKey::PROVIDER_ID).as_deref(), Some("P-3"));

        let untouched = project(&ctx, Some("evil.example.com"), &settings, pseudo).unwrap();
        assert_eq!(untouched.terminal_id(), None);
    }

    #[test]
    fn test_case_conversion() {
        assert_eq!(snake_case("X-Terminal-Id"), "x_terminal_id");
        assert_eq!(snake_case("terminalId"), "terminal_id");
        assert_eq!(camel_case("terminal_id"), "terminalId");
        assert_eq!(camel_case("Provider-Id"), "providerId");
        assert_eq!(camel_case("email"), "email");
    }
}
