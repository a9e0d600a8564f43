//! Development server with live reload.
//!
//! Pages render on demand from the in-memory file tree instead of being
//! served from disk, so edits show up on the next request. Three
//! concurrent activities cooperate:
//!
//! - the HTTP handler, taking the site barrier as a reader;
//! - the change detector (see `watch`), taking it as a writer to reload
//!   caches before broadcasting a reload;
//! - the websocket hub fanning `reload` out to connected browsers.

use crate::errors::not_found_page;
use crate::finder::find_file;
use crate::render::render_page;
use crate::site::{BuildState, Context, GenPage};
use crate::tree::FileType;
use anyhow::{Context as _, Result};
use axum::{
    Router,
    extract::State,
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    http::{StatusCode, Uri, header},
    response::{Html, IntoResponse, Response},
    routing::get,
};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

pub const RELOAD_PATH: &str = "/_spindle/reload";

/// Injected into pages through `%spindle.reload_script`; reconnects after
/// two seconds and reloads on any message.
pub const RELOAD_SCRIPT: &str = r#"<script type="text/javascript">function spindle_reload() {
    var socket = new WebSocket("ws://" + window.location.host + "/_spindle/reload");
    socket.onclose = function(evt) { setTimeout(() => spindle_reload(), 2000); };
    socket.onmessage = function(evt) { location.reload(); };
}
spindle_reload()</script>"#;

const PONG_WAIT: Duration = Duration::from_secs(60);
/// Ping at 90% of the pong deadline.
const PING_PERIOD: Duration = Duration::from_millis(PONG_WAIT.as_millis() as u64 * 9 / 10);

/// Per-client outgoing buffer; a client that falls this far behind is
/// dropped.
const CLIENT_BUFFER: usize = 256;

/// Shared server state: the context behind the readers-writer barrier,
/// plus the taginator pages discovered by earlier renders so their URLs
/// stay servable.
pub struct SharedSite {
    pub ctx: RwLock<Context>,
    pub gen_pages: Mutex<FxHashMap<String, GenPage>>,
    pub hub: Hub,
}

/// Run the dev server until ctrl-c.
pub async fn serve_site(mut ctx: Context) -> Result<()> {
    ctx.server_mode = true;
    let port = ctx.config.port;

    let (hub, hub_rx) = Hub::new();
    tokio::spawn(run_hub(hub_rx));

    let site = Arc::new(SharedSite {
        ctx: RwLock::new(ctx),
        gen_pages: Mutex::new(FxHashMap::default()),
        hub,
    });

    // the change detector polls at 1 Hz on its own thread
    std::thread::spawn({
        let site = site.clone();
        move || crate::watch::watch_loop(&site)
    });

    let app = Router::new()
        .route(RELOAD_PATH, get(reload_handler))
        .fallback(get(page_handler))
        .with_state(site);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;

    crate::log!("serve"; "serving site on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server failed")?;

    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.ok();
    crate::log!("serve"; "shutting down");
}

// ----------------------------------------------------------------------
// page serving
// ----------------------------------------------------------------------

async fn page_handler(State(site): State<Arc<SharedSite>>, uri: Uri) -> Response {
    let path = urlencoding::decode(uri.path())
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| uri.path().to_owned());

    let query = path.trim_matches('/');
    let query = if query.is_empty() { "index" } else { query };

    let ctx = site.ctx.read();
    let mut state = BuildState::new();

    if let Some(node) = find_file(&ctx.tree, ctx.tree.root, query, &mut state.finder_cache) {
        let file = ctx.tree.node(node);

        if file.file_type == FileType::Markup {
            return render_response(&site, &ctx, &mut state, node, None);
        }

        return match std::fs::read(ctx.tree.real_path(node)) {
            Ok(bytes) => {
                let mime = content_type(file.base_name());
                (
                    [
                        (header::CONTENT_TYPE, mime),
                        (header::CACHE_CONTROL, "no-cache"),
                    ],
                    bytes,
                )
                    .into_response()
            }
            Err(_) => StatusCode::NOT_FOUND.into_response(),
        };
    }

    // taginator outputs only exist after the page that generates them
    // has rendered at least once
    let r#gen = site.gen_pages.lock().get(&format!("/{query}")).cloned();
    if let Some(r#gen) = r#gen {
        return render_response(&site, &ctx, &mut state, r#gen.node, Some(r#gen.tag));
    }

    (
        StatusCode::NOT_FOUND,
        [(header::CACHE_CONTROL, "no-cache")],
        Html(not_found_page(RELOAD_SCRIPT)),
    )
        .into_response()
}

fn render_response(
    site: &SharedSite,
    ctx: &Context,
    state: &mut BuildState,
    node: crate::tree::NodeId,
    tag: Option<String>,
) -> Response {
    let Some(mut page) = ctx.load_page(node, &mut state.errors) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    page.tag = tag;

    let mut assembled = render_page(ctx, state, &page);

    if state.errors.has_failures() {
        assembled = state.errors.render_html_page(RELOAD_SCRIPT);
    } else if state.errors.has_errors() {
        crate::log!("serve"; "{}", state.errors.render_term());
    }

    // keep generated pages servable on later requests
    site.gen_pages
        .lock()
        .extend(state.gen_pages.drain());

    (
        StatusCode::OK,
        [(header::CACHE_CONTROL, "no-cache")],
        Html(assembled),
    )
        .into_response()
}

fn content_type(name: &str) -> &'static str {
    let ext = name.rsplit('.').next().unwrap_or_default();
    match ext {
        "html" => "text/html; charset=utf-8",
        "css" => "text/css",
        "js" => "text/javascript",
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "txt" => "text/plain; charset=utf-8",
        "xml" => "application/xml",
        _ => "application/octet-stream",
    }
}

// ----------------------------------------------------------------------
// websocket hub
// ----------------------------------------------------------------------

enum HubMessage {
    Register {
        id: u64,
        sender: mpsc::Sender<String>,
    },
    Unregister {
        id: u64,
    },
    Broadcast {
        text: String,
    },
}

#[derive(Clone)]
pub struct Hub {
    tx: mpsc::UnboundedSender<HubMessage>,
    next_id: Arc<AtomicU64>,
}

impl Hub {
    fn new() -> (Self, mpsc::UnboundedReceiver<HubMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                next_id: Arc::new(AtomicU64::new(1)),
            },
            rx,
        )
    }

    fn register(&self) -> (u64, mpsc::Receiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(CLIENT_BUFFER);
        self.tx.send(HubMessage::Register { id, sender }).ok();
        (id, receiver)
    }

    fn unregister(&self, id: u64) {
        self.tx.send(HubMessage::Unregister { id }).ok();
    }

    pub fn broadcast(&self, text: &str) {
        self.tx
            .send(HubMessage::Broadcast {
                text: text.to_owned(),
            })
            .ok();
    }
}

/// Single owner of the client table; register, unregister and broadcast
/// arrive over one channel. A client whose buffer is full is dropped —
/// closing its sender is what its write pump observes as shutdown.
async fn run_hub(mut rx: mpsc::UnboundedReceiver<HubMessage>) {
    let mut clients: FxHashMap<u64, mpsc::Sender<String>> = FxHashMap::default();

    while let Some(message) = rx.recv().await {
        match message {
            HubMessage::Register { id, sender } => {
                clients.insert(id, sender);
            }
            HubMessage::Unregister { id } => {
                clients.remove(&id);
            }
            HubMessage::Broadcast { text } => {
                clients.retain(|_, sender| sender.try_send(text.clone()).is_ok());
            }
        }
    }
}

async fn reload_handler(
    State(site): State<Arc<SharedSite>>,
    upgrade: WebSocketUpgrade,
) -> Response {
    let hub = site.hub.clone();
    upgrade.on_upgrade(move |socket| client_session(socket, hub))
}

/// One connected browser: a write pump multiplexing reload messages with
/// periodic pings, and a read pump that only watches for the socket
/// closing.
async fn client_session(socket: WebSocket, hub: Hub) {
    let (id, mut outgoing) = hub.register();
    let (mut sink, mut stream) = socket.split();

    let write_pump = tokio::spawn(async move {
        let mut ping = tokio::time::interval(PING_PERIOD);
        ping.tick().await; // the first tick fires immediately

        loop {
            tokio::select! {
                message = outgoing.recv() => match message {
                    Some(text) => {
                        if sink.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    // dropped by the hub: say goodbye properly
                    None => {
                        sink.send(Message::Close(None)).await.ok();
                        break;
                    }
                },
                _ = ping.tick() => {
                    if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // read pump: drain until the peer goes away
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }

    hub.unregister(id);
    write_pump.abort();
}
