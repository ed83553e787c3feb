use actix_web::HttpRequest;
use std::net::IpAddr;

/// Remote address of the caller. Behind a local reverse proxy the peer is
/// loopback, so the first valid `X-Forwarded-For` entry is used instead.
pub fn client_ip(req: &HttpRequest) -> String {
    let peer = req.peer_addr().map(|addr| addr.ip());

    match peer {
        Some(ip) if !ip.is_loopback() => ip.to_string(),
        _ => forwarded_ip(req)
            .or(peer)
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "0.0.0.0".to_string()),
    }
}

fn forwarded_ip(req: &HttpRequest) -> Option<IpAddr> {
    req.headers()
        .get("X-Forwarded-For")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|first| first.trim().parse::<IpAddr>().ok())
}

pub fn user_agent(req: &HttpRequest) -> &str {
    req.headers()
        .get(actix_web::http::header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
}

/// Coarse (device, browser) labels for the access history.
pub fn describe_agent(user_agent: &str) -> (&'static str, &'static str) {
    let ua = user_agent.to_lowercase();

    let device = if ua.contains("ipad") || ua.contains("tablet") {
        "Tablet"
    } else if ua.contains("mobile") || ua.contains("android") || ua.contains("iphone") {
        "Móvil"
    } else {
        "Escritorio"
    };

    // Order matters: Edge and Opera also announce Chrome, Chrome announces Safari.
    let browser = if ua.contains("edg/") || ua.contains("edge/") {
        "Edge"
    } else if ua.contains("opr/") || ua.contains("opera") {
        "Opera"
    } else if ua.contains("firefox/") {
        "Firefox"
    } else if ua.contains("chrome/") || ua.contains("crios/") {
        "Chrome"
    } else if ua.contains("safari/") {
        "Safari"
    } else {
        "Otro"
    };

    (device, browser)
}
