//
// davmuxd - forward the WebDAV TCP port over the host/guest serial channel.
//
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::exit;

use clap::Parser;
use log::{error, info};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use chezdav::mux;

#[derive(Parser, Debug)]
#[command(name = "davmuxd", version, about = "WebDAV channel multiplexer service")]
struct Opt {
    /// TCP port to listen on
    #[arg(short = 'p', long, default_value_t = 8080)]
    port: u16,

    /// Path of the muxing channel device
    #[arg(long, value_name = "DEV", default_value = mux::DEFAULT_PIPE_PATH)]
    pipe: PathBuf,

    /// Verbose output (repeat for debug output)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
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

    let file = match std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(&opt.pipe)
    {
        Ok(f) => f,
        Err(e) => {
            error!("cannot open {}: {}", opt.pipe.display(), e);
            exit(1);
        }
    };

    // the peer (on the host side) may not be there yet.
    #[cfg(unix)]
    if let Err(e) = mux::wait_for_peer(&file).await {
        error!("waiting for peer on {}: {}", opt.pipe.display(), e);
        exit(1);
    }

    let (pipe_rd, pipe_wr) = match file.try_clone() {
        Ok(wr) => (
            tokio::fs::File::from_std(file),
            tokio::fs::File::from_std(wr),
        ),
        Err(e) => {
            error!("cannot duplicate channel handle: {}", e);
            exit(1);
        }
    };

    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), opt.port);
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("cannot listen on {}: {}", addr, e);
            exit(1);
        }
    };

    info!("muxing {} on {}", opt.pipe.display(), addr);

    let cancel = CancellationToken::new();

    #[cfg(windows)]
    let mapping = {
        let port = opt.port;
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match mux::drive::find_mapped(port) {
                Some(letter) => {
                    info!("drive {}: already mapped", letter);
                    None
                }
                None => mux::drive::map_drive(port, cancel).await.map(|local| {
                    info!("mapped {}", local);
                    local
                }),
            }
        })
    };

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            cancel.cancel();
        });
    }

    let res = mux::run(pipe_rd, pipe_wr, listener, cancel.clone()).await;

    #[cfg(windows)]
    {
        cancel.cancel();
        if let Ok(Some(local)) = mapping.await {
            mux::drive::unmap(&local);
        }
    }

    if let Err(e) = res {
        error!("channel failed: {}", e);
        exit(1);
    }
}
