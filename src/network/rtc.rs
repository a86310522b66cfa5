//! WebRTC peer links
//!
//! Implements [`PeerConnector`] over the `webrtc` crate. Each link owns one
//! `RTCPeerConnection` carrying a single ordered data channel labelled
//! [`DATA_CHANNEL_LABEL`]. Callbacks are translated into [`LinkEvent`]s.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::error::NetworkError;
use super::link::{
    IceCandidate, LinkEvent, LinkEventSender, PeerConnector, PeerLink, DATA_CHANNEL_LABEL,
};

fn rtc_error(e: webrtc::Error) -> NetworkError {
    NetworkError::NegotiationFailed(e.to_string())
}

/// Creates WebRTC links using a fixed ICE server list
#[derive(Debug, Clone)]
pub struct RtcConnector {
    ice_servers: Vec<String>,
}

impl RtcConnector {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }

    async fn new_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, NetworkError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(rtc_error)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(rtc_error)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };

        api.new_peer_connection(config)
            .await
            .map(Arc::new)
            .map_err(rtc_error)
    }
}

#[async_trait]
impl PeerConnector for RtcConnector {
    async fn create_link(
        &self,
        remote_peer_id: &str,
        events: LinkEventSender,
    ) -> Result<Arc<dyn PeerLink>, NetworkError> {
        let pc = self.new_peer_connection().await?;
        let link = Arc::new(RtcLink {
            peer_id: remote_peer_id.to_string(),
            pc,
            channel: Arc::new(Mutex::new(None)),
            events,
        });
        link.install_handlers();
        Ok(link)
    }
}

/// One WebRTC peer connection and its chat channel
pub struct RtcLink {
    peer_id: String,
    pc: Arc<RTCPeerConnection>,
    channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    events: LinkEventSender,
}

impl RtcLink {
    fn install_handlers(&self) {
        let events = self.events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events = events.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) => {
                            events.send(LinkEvent::LocalCandidate(IceCandidate {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_m_line_index: init.sdp_mline_index,
                            }));
                        }
                        Err(e) => warn!("Failed to serialize local candidate: {}", e),
                    }
                })
            }));

        let events = self.events.clone();
        let peer_id = self.peer_id.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let events = events.clone();
                let peer_id = peer_id.clone();
                Box::pin(async move {
                    debug!("Peer {} connection state: {}", peer_id, state);
                    if state == RTCPeerConnectionState::Failed {
                        events.send(LinkEvent::Failed("peer connection failed".to_string()));
                    }
                })
            }));

        // The responder's channel arrives from the remote side
        let events = self.events.clone();
        let holder = self.channel.clone();
        let peer_id = self.peer_id.clone();
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let events = events.clone();
                let holder = holder.clone();
                let peer_id = peer_id.clone();
                Box::pin(async move {
                    if dc.label() != DATA_CHANNEL_LABEL {
                        debug!("Ignoring data channel '{}' from {}", dc.label(), peer_id);
                        return;
                    }
                    info!("Received data channel from {}", peer_id);
                    wire_channel(&dc, events);
                    *holder.lock() = Some(dc);
                })
            }));
    }
}

/// Translate data channel callbacks into link events
fn wire_channel(dc: &Arc<RTCDataChannel>, events: LinkEventSender) {
    let on_open = events.clone();
    dc.on_open(Box::new(move || {
        Box::pin(async move {
            on_open.send(LinkEvent::ChannelOpen);
        })
    }));

    let on_message = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let events = on_message.clone();
        Box::pin(async move {
            if !msg.is_string {
                debug!("Ignoring binary frame ({} bytes)", msg.data.len());
                return;
            }
            match String::from_utf8(msg.data.to_vec()) {
                Ok(text) => {
                    events.send(LinkEvent::Message(text));
                }
                Err(e) => warn!("Non-UTF-8 text frame: {}", e),
            }
        })
    }));

    let on_close = events.clone();
    dc.on_close(Box::new(move || {
        let events = on_close.clone();
        Box::pin(async move {
            events.send(LinkEvent::ChannelClosed);
        })
    }));

    dc.on_error(Box::new(move |e: webrtc::Error| {
        let events = events.clone();
        Box::pin(async move {
            events.send(LinkEvent::Failed(e.to_string()));
        })
    }));
}

#[async_trait]
impl PeerLink for RtcLink {
    async fn create_offer(&self) -> Result<String, NetworkError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(DATA_CHANNEL_LABEL, Some(init))
            .await
            .map_err(rtc_error)?;
        wire_channel(&dc, self.events.clone());
        *self.channel.lock() = Some(dc);

        let offer = self.pc.create_offer(None).await.map_err(rtc_error)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(rtc_error)?;
        Ok(offer.sdp)
    }

    async fn accept_offer(&self, offer_sdp: &str) -> Result<String, NetworkError> {
        let offer = RTCSessionDescription::offer(offer_sdp.to_string()).map_err(rtc_error)?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(rtc_error)?;

        let answer = self.pc.create_answer(None).await.map_err(rtc_error)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(rtc_error)?;
        Ok(answer.sdp)
    }

    async fn accept_answer(&self, answer_sdp: &str) -> Result<(), NetworkError> {
        let answer = RTCSessionDescription::answer(answer_sdp.to_string()).map_err(rtc_error)?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(rtc_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NetworkError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_m_line_index,
            username_fragment: None,
        };
        self.pc.add_ice_candidate(init).await.map_err(rtc_error)
    }

    async fn send(&self, text: String) -> Result<(), NetworkError> {
        let dc = self.channel.lock().clone().ok_or(NetworkError::ChannelClosed)?;
        dc.send_text(text)
            .await
            .map(|_| ())
            .map_err(|e| NetworkError::Io(std::io::Error::other(e.to_string())))
    }

    async fn close(&self) {
        let dc = self.channel.lock().take();
        if let Some(dc) = dc {
            if let Err(e) = dc.close().await {
                debug!("Closing channel to {}: {}", self.peer_id, e);
            }
        }
        if let Err(e) = self.pc.close().await {
            debug!("Closing connection to {}: {}", self.peer_id, e);
        }
    }
}
