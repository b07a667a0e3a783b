//! Management RPC (NIP-86)
//!
//! JSON-RPC over HTTP POST with `Content-Type: application/nostr+json+rpc`.
//! Every request must carry a NIP-98 `Authorization: Nostr <base64>` header
//! signed by the configured admin pubkey. Mutations rewrite the policy file
//! atomically before the response is sent.

use crate::config::Config;
use crate::error::Result;
use crate::metrics::RelayMetrics;
use crate::policy::AdminPolicy;
use nostr_core::nip98::{self, HttpMethod, ValidationParams};
use serde::Deserialize;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{info, warn};
use warp::Filter;
use warp::http::StatusCode;

pub const RPC_CONTENT_TYPE: &str = "application/nostr+json+rpc";

const SUPPORTED_METHODS: &[&str] = &[
    "supportedmethods",
    "banpubkey",
    "listbannedpubkeys",
    "allowpubkey",
    "listallowedpubkeys",
    "banevent",
    "listbannedevents",
    "allowkind",
    "disallowkind",
    "listallowedkinds",
    "blockip",
    "unblockip",
    "listblockedips",
    "changerelayname",
    "changerelaydescription",
    "changerelayicon",
    "getstats",
    "getlimits",
    "getconnections",
];

#[derive(Debug, Deserialize)]
struct RpcRequest {
    method: String,
    #[serde(default)]
    params: Vec<Value>,
}

#[derive(Clone)]
pub struct AdminContext {
    pub config: Arc<Config>,
    pub admin: Arc<RwLock<AdminPolicy>>,
    pub metrics: Arc<RelayMetrics>,
    pub policy_path: PathBuf,
    /// Absolute URL clients sign in the NIP-98 `u` tag.
    pub admin_url: String,
}

impl AdminContext {
    pub fn new(
        config: Arc<Config>,
        admin: Arc<RwLock<AdminPolicy>>,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        let policy_path = PathBuf::from(&config.policy_file);
        let admin_url = format!("http://{}/", config.http_listen);
        Self {
            config,
            admin,
            metrics,
            policy_path,
            admin_url,
        }
    }
}

fn unix_now() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(_) => 0,
    }
}

/// POST / route carrying the RPC body.
pub fn admin_route(
    ctx: AdminContext,
) -> impl Filter<Extract = (impl warp::Reply,), Error = warp::Rejection> + Clone {
    let ctx = Arc::new(ctx);
    warp::path::end()
        .and(warp::post())
        .and(warp::header::optional::<String>("content-type"))
        .and(warp::header::optional::<String>("authorization"))
        .and(warp::body::bytes())
        .map(move |content_type, authorization, body: warp::hyper::body::Bytes| {
            let (status, reply) = handle_request(&ctx, content_type, authorization, &body);
            warp::reply::with_status(warp::reply::json(&reply), status)
        })
}

fn rpc_error(status: StatusCode, message: &str) -> (StatusCode, Value) {
    (status, json!({"result": null, "error": message}))
}

pub fn handle_request(
    ctx: &AdminContext,
    content_type: Option<String>,
    authorization: Option<String>,
    body: &[u8],
) -> (StatusCode, Value) {
    if content_type.as_deref() != Some(RPC_CONTENT_TYPE) {
        return rpc_error(StatusCode::BAD_REQUEST, "unsupported content type");
    }

    if ctx.config.admin_pubkey.is_none() {
        return rpc_error(StatusCode::NOT_IMPLEMENTED, "admin interface disabled");
    }

    if let Err(message) = authorize(ctx, authorization.as_deref(), body) {
        warn!("admin request rejected: {}", message);
        return rpc_error(StatusCode::UNAUTHORIZED, &message);
    }

    let request: RpcRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(e) => {
            return rpc_error(StatusCode::BAD_REQUEST, &format!("bad request: {}", e));
        }
    };

    if !SUPPORTED_METHODS.contains(&request.method.as_str()) {
        return rpc_error(StatusCode::NOT_IMPLEMENTED, "unknown method");
    }

    match dispatch(ctx, &request) {
        Ok(result) => (StatusCode::OK, json!({"result": result, "error": null})),
        Err(message) => rpc_error(StatusCode::BAD_REQUEST, &message),
    }
}

fn authorize(
    ctx: &AdminContext,
    authorization: Option<&str>,
    body: &[u8],
) -> std::result::Result<(), String> {
    let Some(expected_admin) = ctx.config.admin_pubkey.as_deref() else {
        return Err("no admin pubkey configured".to_string());
    };
    let header = authorization.ok_or_else(|| "missing authorization header".to_string())?;
    let event = nip98::decode_authorization_header(header).map_err(|e| e.to_string())?;

    let params = ValidationParams::new(ctx.admin_url.clone(), HttpMethod::Post, unix_now())
        .with_payload_hash(nip98::hash_payload(body));
    let pubkey = nip98::validate_auth_event(&event, &params).map_err(|e| e.to_string())?;

    if pubkey != expected_admin {
        return Err("pubkey is not the relay admin".to_string());
    }
    Ok(())
}

fn str_param(request: &RpcRequest, index: usize) -> std::result::Result<String, String> {
    request
        .params
        .get(index)
        .and_then(|v| v.as_str())
        .map(String::from)
        .ok_or_else(|| format!("{}: missing string param {}", request.method, index))
}

fn kind_param(request: &RpcRequest, index: usize) -> std::result::Result<u32, String> {
    request
        .params
        .get(index)
        .and_then(|v| v.as_u64())
        .and_then(|k| u32::try_from(k).ok())
        .ok_or_else(|| format!("{}: missing kind param {}", request.method, index))
}

fn dispatch(ctx: &AdminContext, request: &RpcRequest) -> std::result::Result<Value, String> {
    match request.method.as_str() {
        "supportedmethods" => Ok(json!(SUPPORTED_METHODS)),
        "getstats" => Ok(serde_json::to_value(ctx.metrics.snapshot())
            .map_err(|e| format!("getstats: {}", e))?),
        "getconnections" => Ok(json!({"active": ctx.metrics.active_connections()})),
        "getlimits" => Ok(json!({
            "max_filters": ctx.config.max_filters,
            "max_limit": ctx.config.max_limit,
            "max_subscriptions": ctx.config.max_subs,
            "max_message_size": ctx.config.max_message_size,
            "rate_ops_per_sec": ctx.config.rate_ops_per_sec,
            "rate_burst": ctx.config.rate_burst,
        })),
        method => mutate(ctx, method, request),
    }
}

/// Read-modify-write on the shared policy; persisted before returning.
fn mutate(
    ctx: &AdminContext,
    method: &str,
    request: &RpcRequest,
) -> std::result::Result<Value, String> {
    let mut policy = ctx
        .admin
        .write()
        .map_err(|_| "policy lock poisoned".to_string())?;

    let result = match method {
        "banpubkey" => {
            let pubkey = str_param(request, 0)?;
            policy.banned_pubkeys.insert(pubkey);
            json!(true)
        }
        "listbannedpubkeys" => {
            let list: Vec<Value> = policy
                .banned_pubkeys
                .iter()
                .map(|p| json!({"pubkey": p}))
                .collect();
            return Ok(json!(list));
        }
        "allowpubkey" => {
            let pubkey = str_param(request, 0)?;
            policy.allowed_pubkeys.insert(pubkey);
            json!(true)
        }
        "listallowedpubkeys" => {
            let list: Vec<Value> = policy
                .allowed_pubkeys
                .iter()
                .map(|p| json!({"pubkey": p}))
                .collect();
            return Ok(json!(list));
        }
        "banevent" => {
            let id = str_param(request, 0)?;
            policy.banned_events.insert(id);
            json!(true)
        }
        "listbannedevents" => {
            let list: Vec<Value> = policy
                .banned_events
                .iter()
                .map(|id| json!({"id": id}))
                .collect();
            return Ok(json!(list));
        }
        "allowkind" => {
            policy.allowed_kinds.insert(kind_param(request, 0)?);
            json!(true)
        }
        "disallowkind" => {
            let removed = policy.allowed_kinds.remove(&kind_param(request, 0)?);
            json!(removed)
        }
        "listallowedkinds" => {
            return Ok(json!(policy.allowed_kinds.iter().collect::<Vec<_>>()));
        }
        "blockip" => {
            policy.blocked_ips.insert(str_param(request, 0)?);
            json!(true)
        }
        "unblockip" => {
            let removed = policy.blocked_ips.remove(&str_param(request, 0)?);
            json!(removed)
        }
        "listblockedips" => {
            return Ok(json!(policy.blocked_ips.iter().collect::<Vec<_>>()));
        }
        "changerelayname" => {
            policy.relay_name = Some(str_param(request, 0)?);
            json!(true)
        }
        "changerelaydescription" => {
            policy.relay_description = Some(str_param(request, 0)?);
            json!(true)
        }
        "changerelayicon" => {
            policy.relay_icon = Some(str_param(request, 0)?);
            json!(true)
        }
        other => return Err(format!("unknown method {}", other)),
    };

    policy
        .save(&ctx.policy_path)
        .map_err(|e| format!("policy save failed: {}", e))?;
    info!(method, "admin policy updated");
    Ok(result)
}

/// Load the persisted policy named by the config, defaulting when absent.
pub fn load_policy(config: &Config) -> Result<AdminPolicy> {
    AdminPolicy::load(std::path::Path::new(&config.policy_file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nostr_core::nip98::{HttpAuth, build_auth_event, encode_authorization_header};
    use nostr_core::{generate_secret_key, get_public_key_hex};
    use tempfile::TempDir;

    fn test_ctx(dir: &TempDir, admin_pubkey: Option<String>) -> AdminContext {
        let mut config = Config::default();
        config.policy_file = dir
            .path()
            .join("policy.json")
            .to_string_lossy()
            .into_owned();
        config.admin_pubkey = admin_pubkey;
        AdminContext::new(
            Arc::new(config),
            Arc::new(RwLock::new(AdminPolicy::default())),
            Arc::new(RelayMetrics::new()),
        )
    }

    fn signed_header(ctx: &AdminContext, sk: &[u8; 32], body: &[u8]) -> String {
        let auth = HttpAuth::new(ctx.admin_url.clone(), HttpMethod::Post)
            .with_payload_hash(nip98::hash_payload(body));
        let event = build_auth_event(&auth, sk, unix_now()).unwrap();
        encode_authorization_header(&event).unwrap()
    }

    #[test]
    fn test_rejects_wrong_content_type() {
        let dir = TempDir::new().unwrap();
        let ctx = test_ctx(&dir, None);
        let (status, _) = handle_request(&ctx, Some("application/json".to_string()), None, b"{}");
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_disabled_admin_is_501() {
        let dir = TempDir::new().unwrap();
        let ctx = test_ctx(&dir, None);
        let (status, _) = handle_request(&ctx, Some(RPC_CONTENT_TYPE.to_string()), None, b"{}");
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
    }

    #[test]
    fn test_rejects_missing_auth() {
        let dir = TempDir::new().unwrap();
        let ctx = test_ctx(&dir, Some("aa".repeat(32)));
        let (status, reply) =
            handle_request(&ctx, Some(RPC_CONTENT_TYPE.to_string()), None, b"{}");
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(reply["error"].as_str().is_some());
    }

    #[test]
    fn test_rejects_non_admin_pubkey() {
        let dir = TempDir::new().unwrap();
        let ctx = test_ctx(&dir, Some("aa".repeat(32)));
        let sk = generate_secret_key();
        let body = br#"{"method":"getstats","params":[]}"#;
        let header = signed_header(&ctx, &sk, body);

        let (status, _) = handle_request(
            &ctx,
            Some(RPC_CONTENT_TYPE.to_string()),
            Some(header),
            body,
        );
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_full_request_and_mutation() {
        let dir = TempDir::new().unwrap();
        let sk = generate_secret_key();
        let admin_pubkey = get_public_key_hex(&sk).unwrap();
        let ctx = test_ctx(&dir, Some(admin_pubkey));

        let body = br#"{"method":"banpubkey","params":["deadbeef"]}"#;
        let header = signed_header(&ctx, &sk, body);
        let (status, reply) = handle_request(
            &ctx,
            Some(RPC_CONTENT_TYPE.to_string()),
            Some(header),
            body,
        );
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reply["result"], json!(true));
        assert!(reply["error"].is_null());

        // mutation is visible in the shared policy and on disk
        assert!(
            ctx.admin
                .read()
                .unwrap()
                .banned_pubkeys
                .contains("deadbeef")
        );
        let reloaded = AdminPolicy::load(&ctx.policy_path).unwrap();
        assert!(reloaded.banned_pubkeys.contains("deadbeef"));
    }

    #[test]
    fn test_unknown_method_is_501() {
        let dir = TempDir::new().unwrap();
        let sk = generate_secret_key();
        let ctx = test_ctx(&dir, Some(get_public_key_hex(&sk).unwrap()));

        let body = br#"{"method":"selfdestruct","params":[]}"#;
        let header = signed_header(&ctx, &sk, body);
        let (status, _) = handle_request(
            &ctx,
            Some(RPC_CONTENT_TYPE.to_string()),
            Some(header),
            body,
        );
        assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
    }

    #[test]
    fn test_tampered_body_fails_payload_hash() {
        let dir = TempDir::new().unwrap();
        let sk = generate_secret_key();
        let ctx = test_ctx(&dir, Some(get_public_key_hex(&sk).unwrap()));

        let signed_body = br#"{"method":"getstats","params":[]}"#;
        let header = signed_header(&ctx, &sk, signed_body);
        let sent_body = br#"{"method":"banpubkey","params":["deadbeef"]}"#;
        let (status, _) = handle_request(
            &ctx,
            Some(RPC_CONTENT_TYPE.to_string()),
            Some(header),
            sent_body,
        );
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn test_dispatch_lists_and_kinds() {
        let dir = TempDir::new().unwrap();
        let ctx = test_ctx(&dir, None);

        let allow = RpcRequest {
            method: "allowkind".to_string(),
            params: vec![json!(30023)],
        };
        assert_eq!(dispatch(&ctx, &allow).unwrap(), json!(true));

        let list = RpcRequest {
            method: "listallowedkinds".to_string(),
            params: vec![],
        };
        assert_eq!(dispatch(&ctx, &list).unwrap(), json!([30023]));

        let disallow = RpcRequest {
            method: "disallowkind".to_string(),
            params: vec![json!(30023)],
        };
        assert_eq!(dispatch(&ctx, &disallow).unwrap(), json!(true));
        assert_eq!(dispatch(&ctx, &disallow).unwrap(), json!(false));
    }

    #[test]
    fn test_getlimits_reflects_config() {
        let dir = TempDir::new().unwrap();
        let ctx = test_ctx(&dir, None);
        let request = RpcRequest {
            method: "getlimits".to_string(),
            params: vec![],
        };
        let limits = dispatch(&ctx, &request).unwrap();
        assert_eq!(limits["max_filters"], json!(ctx.config.max_filters));
        assert_eq!(limits["rate_burst"], json!(ctx.config.rate_burst));
    }
}
