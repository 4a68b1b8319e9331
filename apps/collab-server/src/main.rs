//! WebSocket fan-out server for collaborative document editing.
//!
//! Each connection opens exactly one document and holds one bus
//! subscription; committed writes and cursor updates reach the client
//! through an unbounded channel drained by a dedicated writer task. All
//! conflict resolution happens client-side, so the server only forwards
//! store state and CAS outcomes.

use std::net::SocketAddr;
use std::sync::Arc;

use collab::{
    Actor, ClientMessage, CollabError, CursorPosition, DocumentStore, OpenTarget, ServerMessage,
    StoreError, Subscription, SyncBus, UserColor,
};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

type Tx = mpsc::UnboundedSender<Message>;

/// Per-connection state established by the `open` message.
struct ClientState {
    subscription: Subscription,
    actor: Actor,
    color: UserColor,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "collab_server=debug,collab=debug".into()),
        )
        .init();

    let addr = std::env::var("COLLAB_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
    let db_path = std::env::var("COLLAB_DB").unwrap_or_else(|_| "collab.db".to_string());

    let store = Arc::new(DocumentStore::open(std::path::Path::new(&db_path))?);
    let bus = Arc::new(SyncBus::new(store));

    let listener = TcpListener::bind(&addr).await?;
    info!("collaboration server listening on {}", addr);

    while let Ok((stream, peer)) = listener.accept().await {
        info!("new connection from {}", peer);
        tokio::spawn(handle_connection(stream, peer, Arc::clone(&bus)));
    }

    Ok(())
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, bus: Arc<SyncBus>) {
    let ws_stream = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", peer, e);
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = ws_sender.send(msg).await {
                error!("failed to send message: {}", e);
                break;
            }
        }
    });

    let mut state: Option<ClientState> = None;

    while let Some(msg) = ws_receiver.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                error!("error receiving from {}: {}", peer, e);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                if let Err(e) = handle_client_message(&text, &bus, &tx, &mut state) {
                    warn!("error handling message from {}: {}", peer, e);
                    send(&tx, &ServerMessage::Error {
                        message: e.to_string(),
                    });
                }
            }
            Message::Ping(data) => {
                let _ = tx.send(Message::Pong(data));
            }
            Message::Close(_) => {
                info!("{} requested close", peer);
                break;
            }
            _ => {}
        }
    }

    if let Some(state) = state.take() {
        info!(
            "user {} left document {}",
            state.actor.user_id,
            state.subscription.document_id()
        );
        state.subscription.unsubscribe();
    }
    send_task.abort();
    info!("connection closed: {}", peer);
}

fn handle_client_message(
    text: &str,
    bus: &Arc<SyncBus>,
    tx: &Tx,
    state: &mut Option<ClientState>,
) -> anyhow::Result<()> {
    let msg: ClientMessage = serde_json::from_str(text)?;

    match msg {
        ClientMessage::Open {
            user_id,
            user_name,
            target,
        } => {
            if state.is_some() {
                anyhow::bail!("connection already has an open document");
            }
            let actor = Actor::new(user_id, user_name);
            let document = match &target {
                OpenTarget::DocumentId(id) => bus.fetch(*id)?,
                OpenTarget::LinkedEntity(entity) => bus.fetch_or_create_for_entity(entity, &actor)?,
            };
            let join_index = bus.join(document.id, actor.user_id)?;
            let color = UserColor::for_join_index(join_index);

            let doc_tx = tx.clone();
            let cursor_tx = tx.clone();
            let (snapshot, subscription) = bus.subscribe(
                document.id,
                move |doc| {
                    send(&doc_tx, &ServerMessage::Document { document: doc });
                },
                move |cursors| {
                    send(&cursor_tx, &ServerMessage::Cursors { cursors });
                },
            )?;

            info!(
                "user {} opened document {}",
                actor.user_id, document.id
            );
            send(tx, &ServerMessage::Document { document: snapshot });
            *state = Some(ClientState {
                subscription,
                actor,
                color,
            });
        }

        ClientMessage::Edit {
            content,
            expected_version,
        } => {
            let state = state
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("no document open on this connection"))?;
            let document_id = state.subscription.document_id();
            match bus.write(document_id, &content, state.actor.user_id, expected_version) {
                Ok(version) => send(tx, &ServerMessage::EditAck { version }),
                Err(CollabError::Store(StoreError::Conflict {
                    current_version,
                    current_content,
                })) => send(
                    tx,
                    &ServerMessage::Conflict {
                        current_version,
                        current_content,
                    },
                ),
                Err(e) => return Err(e.into()),
            }
        }

        ClientMessage::Cursor { position } => {
            let state = state
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("no document open on this connection"))?;
            // Cursors always go out under the connection's own identity.
            state.subscription.send_cursor(CursorPosition {
                user_id: state.actor.user_id,
                user_name: state.actor.user_name.clone(),
                position,
                color: state.color,
            });
        }

        ClientMessage::Ping => send(tx, &ServerMessage::Pong),
    }

    Ok(())
}

fn send(tx: &Tx, msg: &ServerMessage) {
    match serde_json::to_string(msg) {
        Ok(json) => {
            let _ = tx.send(Message::Text(json));
        }
        Err(e) => error!("failed to serialize message: {}", e),
    }
}
