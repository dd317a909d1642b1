//! WebRTC session acceptance.
//!
//! A client hands the server an SDP offer out of band; the server builds a
//! peer connection with its long-lived DTLS material, answers, and waits
//! for the client's data channel to land. The first channel becomes the
//! bonded tunnel: its messages feed the billing pipeline and pipeline
//! output goes back down it. Sessions retain themselves through the
//! server's registry and drop out of it on stop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::error::ServerError;
use crate::sdp::filter_answer;
use crate::server::Server;
use crate::DatagramLink;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// A live peer connection bonded to the server's pipeline.
pub struct Session {
    id: u64,
    server: Server,
    peer: Arc<RTCPeerConnection>,
    channel: OnceLock<Arc<RTCDataChannel>>,
}

impl Session {
    /// Accepts an offer: builds the peer, wires the data-channel hooks,
    /// and returns the session together with its filtered SDP answer.
    pub(crate) async fn accept(
        server: Server,
        offer_sdp: &str,
    ) -> Result<(Arc<Self>, String), ServerError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(transport_error)?;
        let mut registry = Registry::new();
        registry =
            register_default_interceptors(registry, &mut media_engine).map_err(transport_error)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = &server.inner().config;
        let peer = api
            .new_peer_connection(RTCConfiguration {
                ice_servers: config
                    .ice_servers
                    .iter()
                    .map(|url| RTCIceServer {
                        urls: vec![url.clone()],
                        ..Default::default()
                    })
                    .collect(),
                certificates: config.certificates.clone(),
                ..Default::default()
            })
            .await
            .map_err(transport_error)?;

        let session = Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            server: server.clone(),
            peer: Arc::new(peer),
            channel: OnceLock::new(),
        });
        session.install_hooks();

        let offer = RTCSessionDescription::offer(offer_sdp.to_owned()).map_err(transport_error)?;
        session
            .peer
            .set_remote_description(offer)
            .await
            .map_err(transport_error)?;

        let answer = session.peer.create_answer(None).await.map_err(transport_error)?;
        let mut gathered = session.peer.gathering_complete_promise().await;
        session
            .peer
            .set_local_description(answer)
            .await
            .map_err(transport_error)?;
        let _ = gathered.recv().await;

        let local = session
            .peer
            .local_description()
            .await
            .ok_or_else(|| ServerError::Transport("missing local description".into()))?;

        server.adopt(session.id, Arc::clone(&session));
        Ok((Arc::clone(&session), filter_answer(&local.sdp)))
    }

    fn install_hooks(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.peer
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let weak = weak.clone();
                Box::pin(async move {
                    if matches!(
                        state,
                        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                    ) {
                        if let Some(session) = weak.upgrade() {
                            debug!(session = session.id, ?state, "peer connection ended");
                            session.stop();
                        }
                    }
                })
            }));

        let weak = Arc::downgrade(self);
        self.peer.on_data_channel(Box::new(move |channel| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(session) = weak.upgrade() else {
                    return;
                };
                session.bond(channel);
            })
        }));
    }

    /// Bonds the first data channel; later channels are ignored.
    fn bond(self: &Arc<Self>, channel: Arc<RTCDataChannel>) {
        if self.channel.set(Arc::clone(&channel)).is_err() {
            trace!(session = self.id, "ignoring extra data channel");
            return;
        }
        let link: Arc<dyn DatagramLink> = Arc::new(ChannelLink {
            channel: Arc::clone(&channel),
        });

        let weak = Arc::downgrade(self);
        let open_link = Arc::clone(&link);
        channel.on_open(Box::new(move || {
            let weak = weak.clone();
            let link = Arc::clone(&open_link);
            Box::pin(async move {
                let Some(session) = weak.upgrade() else {
                    return;
                };
                // A failed open hook means the tunnel is useless: close the
                // session and emit nothing.
                if let Err(error) = session.server.open_link(link).await {
                    warn!(session = session.id, %error, "session open failed");
                    session.close().await;
                }
            })
        }));

        let weak = Arc::downgrade(self);
        let message_link = link;
        channel.on_message(Box::new(move |message: DataChannelMessage| {
            let weak = weak.clone();
            let link = Arc::clone(&message_link);
            Box::pin(async move {
                if let Some(session) = weak.upgrade() {
                    session.server.inbound(&link, message.data).await;
                }
            })
        }));

        let weak = Arc::downgrade(self);
        channel.on_close(Box::new(move || {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(session) = weak.upgrade() {
                    debug!(session = session.id, "data channel closed");
                    session.stop();
                }
            })
        }));
    }

    /// Drops the self-reference. The transport teardown follows from the
    /// last reference going away or from an explicit [`Session::close`].
    pub fn stop(&self) {
        self.server.release(self.id);
    }

    /// Stops and closes the underlying peer connection.
    pub async fn close(&self) {
        self.stop();
        if let Err(error) = self.peer.close().await {
            debug!(session = self.id, %error, "peer close failed");
        }
    }

    /// The session id used in the server's registry.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Server {
    /// Accepts a client's SDP offer and returns the filtered answer.
    ///
    /// The session registers itself with the server and stays alive until
    /// it stops; candidates bound to private addresses never appear in the
    /// answer.
    pub async fn respond(&self, offer_sdp: &str) -> Result<String, ServerError> {
        let (session, answer) = Session::accept(self.clone(), offer_sdp).await?;
        debug!(session = session.id(), "accepted session");
        Ok(answer)
    }
}

struct ChannelLink {
    channel: Arc<RTCDataChannel>,
}

#[async_trait]
impl DatagramLink for ChannelLink {
    async fn send(&self, data: Bytes) -> Result<(), ServerError> {
        self.channel
            .send(&data)
            .await
            .map(|_| ())
            .map_err(transport_error)
    }
}

fn transport_error(error: webrtc::Error) -> ServerError {
    ServerError::Transport(error.to_string())
}
