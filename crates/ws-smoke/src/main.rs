use futures_util::{SinkExt, StreamExt};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

const DEFAULT_URL: &str = "ws://127.0.0.1:8080/ws/events";
const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    let mut args = std::env::args().skip(1);
    let raw = args.next().unwrap_or_else(|| DEFAULT_URL.to_string());
    let frames: usize = match args.next().map(|n| n.parse()) {
        None => 1,
        Some(Ok(n)) if n > 0 => n,
        Some(_) => {
            eprintln!("Frame count must be a positive integer");
            std::process::exit(1);
        }
    };

    let url = match Url::parse(&raw) {
        Ok(url) if matches!(url.scheme(), "ws" | "wss") => url,
        Ok(url) => {
            eprintln!("Unsupported scheme {:?}, expected ws or wss", url.scheme());
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Invalid url {}: {}", raw, e);
            std::process::exit(1);
        }
    };

    eprintln!("Connecting to {}", url);
    let (ws_stream, _) = match connect_async(url.as_str()).await {
        Ok(conn) => conn,
        Err(e) => {
            eprintln!("WS connect failed: {}", e);
            std::process::exit(2);
        }
    };
    let (mut write, mut read) = ws_stream.split();

    // First frame is the greeting snapshot, later ones carry events
    let mut seen = 0;
    while seen < frames {
        match timeout(FRAME_TIMEOUT, read.next()).await {
            Ok(Some(Ok(Message::Text(t)))) => {
                seen += 1;
                println!("[{}/{}] {}", seen, frames, t);
            }
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {
                eprintln!("WS closed by server after {} frame(s)", seen);
                std::process::exit(3);
            }
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(e))) => {
                eprintln!("WS receive error: {}", e);
                std::process::exit(2);
            }
            Err(_) => {
                eprintln!("Timeout waiting for alarm frame {} of {}", seen + 1, frames);
                std::process::exit(4);
            }
        }
    }

    let _ = write.send(Message::Close(None)).await;
}
