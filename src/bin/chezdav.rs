//
// chezdav - share a directory over WebDAV.
//
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

use clap::Parser;
use http::{Request, Response};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use log::{debug, error, info, warn};
use md5::{Digest, Md5};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use chezdav::body::Body;
use chezdav::localfs::LocalFs;
use chezdav::locks::LockManager;
use chezdav::DavHandler;

#[derive(Parser, Debug)]
#[command(name = "chezdav", version, about = "Simple WebDAV file sharing server")]
struct Opt {
    /// Port to listen on
    #[arg(short = 'p', long, default_value_t = 8080)]
    port: u16,

    /// Listen on loopback only
    #[arg(long, conflicts_with = "public")]
    local: bool,

    /// Listen on all interfaces (default)
    #[arg(long)]
    public: bool,

    /// Path to export
    #[arg(short = 'P', long, value_name = "DIR")]
    path: Option<PathBuf>,

    /// Path to a htdigest file; enables Digest authentication
    #[arg(short = 'd', long, value_name = "FILE")]
    htdigest: Option<PathBuf>,

    /// Digest authentication realm
    #[arg(long, value_name = "REALM")]
    realm: Option<String>,

    /// Read-only access
    #[arg(short = 'r', long)]
    readonly: bool,

    /// Skip the mDNS service announcement
    #[arg(long)]
    no_mdns: bool,

    /// Verbose output (repeat for debug output)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "user".to_string())
}

fn homedir() -> PathBuf {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

// Digest authentication against an Apache htdigest file
// (user:realm:md5(user:realm:password) per line).
struct DigestAuth {
    realm: String,
    // user -> HA1
    users: HashMap<String, String>,
}

impl DigestAuth {
    fn load(path: &PathBuf, realm: &str) -> std::io::Result<DigestAuth> {
        let data = std::fs::read_to_string(path)?;
        let mut users = HashMap::new();
        for line in data.lines() {
            let mut fields = line.trim().splitn(3, ':');
            if let (Some(user), Some(file_realm), Some(ha1)) =
                (fields.next(), fields.next(), fields.next())
            {
                if file_realm == realm {
                    users.insert(user.to_string(), ha1.to_string());
                }
            }
        }
        Ok(DigestAuth {
            realm: realm.to_string(),
            users,
        })
    }

    fn challenge(&self) -> Response<Body> {
        let nonce = hex(&Md5::digest(uuid::Uuid::new_v4().as_bytes()));
        Response::builder()
            .status(http::StatusCode::UNAUTHORIZED)
            .header(
                "WWW-Authenticate",
                format!(
                    "Digest realm=\"{}\", nonce=\"{}\", qop=\"auth\"",
                    self.realm, nonce
                ),
            )
            .header("content-length", "0")
            .body(Body::empty())
            .unwrap()
    }

    // None when authorized, otherwise the 401 challenge.
    fn check<B>(&self, req: &Request<B>) -> Option<Response<Body>> {
        let header = match req
            .headers()
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Digest "))
        {
            Some(h) => h,
            None => return Some(self.challenge()),
        };
        let fields = parse_auth_fields(header);
        if self.verify(req.method().as_str(), &fields) {
            None
        } else {
            debug!("digest authentication failed");
            Some(self.challenge())
        }
    }

    fn verify(&self, method: &str, fields: &HashMap<String, String>) -> bool {
        let get = |k: &str| fields.get(k).map(|s| s.as_str());
        let (user, realm, nonce, uri, response) = match (
            get("username"),
            get("realm"),
            get("nonce"),
            get("uri"),
            get("response"),
        ) {
            (Some(u), Some(r), Some(n), Some(uri), Some(resp)) => (u, r, n, uri, resp),
            _ => return false,
        };
        if realm != self.realm {
            return false;
        }
        let ha1 = match self.users.get(user) {
            Some(ha1) => ha1,
            None => return false,
        };
        let ha2 = md5_hex(&format!("{}:{}", method, uri));
        let expected = match (get("qop"), get("nc"), get("cnonce")) {
            (Some(qop), Some(nc), Some(cnonce)) => {
                md5_hex(&format!("{}:{}:{}:{}:{}:{}", ha1, nonce, nc, cnonce, qop, ha2))
            }
            _ => md5_hex(&format!("{}:{}:{}", ha1, nonce, ha2)),
        };
        expected.eq_ignore_ascii_case(response)
    }
}

fn md5_hex(s: &str) -> String {
    hex(&Md5::digest(s.as_bytes()))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

// Parse the comma separated key=value (possibly quoted) fields of an
// Authorization: Digest header.
fn parse_auth_fields(s: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    let mut rest = s.trim();
    while !rest.is_empty() {
        let eq = match rest.find('=') {
            Some(p) => p,
            None => break,
        };
        let key = rest[..eq].trim().to_string();
        rest = &rest[eq + 1..];
        let value;
        if let Some(stripped) = rest.strip_prefix('"') {
            let end = match stripped.find('"') {
                Some(p) => p,
                None => break,
            };
            value = stripped[..end].to_string();
            rest = stripped[end + 1..].trim_start_matches(',').trim_start();
        } else {
            let end = rest.find(',').unwrap_or(rest.len());
            value = rest[..end].trim().to_string();
            rest = rest[end..].trim_start_matches(',').trim_start();
        }
        fields.insert(key, value);
    }
    fields
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default)).init();
}

#[tokio::main]
async fn main() {
    let opt = Opt::try_parse().unwrap_or_else(|e| {
        let _ = e.print();
        exit(1);
    });
    init_logging(opt.verbose);

    let dir = opt.path.clone().unwrap_or_else(homedir);
    if !dir.is_dir() {
        error!("{}: not a directory", dir.display());
        exit(1);
    }

    let realm = opt
        .realm
        .clone()
        .unwrap_or_else(|| format!("{}'s public share", username()));

    let auth = match opt.htdigest {
        Some(ref path) => match DigestAuth::load(path, &realm) {
            Ok(auth) => Some(Arc::new(auth)),
            Err(e) => {
                error!("{}: {}", path.display(), e);
                exit(1);
            }
        },
        None => None,
    };

    let cancel = CancellationToken::new();
    let dav = DavHandler::builder()
        .filesystem(LocalFs::new(&dir, true))
        .locksystem(LockManager::new())
        .readonly(opt.readonly)
        .cancellation(cancel.clone())
        .build_handler();

    let ip = if opt.local {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    } else {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    };
    let addr = SocketAddr::new(ip, opt.port);
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("cannot listen on {}: {}", addr, e);
            exit(1);
        }
    };

    let _mdns = if opt.no_mdns {
        None
    } else {
        match libmdns::Responder::new() {
            Ok(responder) => {
                let svc = responder.register(
                    "_webdav._tcp".to_owned(),
                    realm.clone(),
                    opt.port,
                    &["u=", "p=", "path=/"],
                );
                Some((responder, svc))
            }
            Err(e) => {
                warn!("mDNS announcement unavailable: {}", e);
                None
            }
        }
    };

    info!("Serving {} on {}", dir.display(), addr);

    loop {
        let (stream, peer) = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            conn = listener.accept() => match conn {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    continue;
                }
            },
        };
        debug!("connection from {}", peer);
        let io = TokioIo::new(stream);
        let dav = dav.clone();
        let auth = auth.clone();
        tokio::task::spawn(async move {
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let dav = dav.clone();
                let auth = auth.clone();
                async move {
                    if let Some(ref auth) = auth {
                        if let Some(challenge) = auth.check(&req) {
                            return Ok::<_, Infallible>(challenge);
                        }
                    }
                    Ok(dav.handle(req).await)
                }
            });
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!("connection error: {}", e);
            }
        });
    }

    info!("shutting down");
    cancel.cancel();
}
