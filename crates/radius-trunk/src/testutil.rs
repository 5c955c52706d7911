//! Shared fixtures for unit tests: an in-memory link and a toy codec
//!
//! The mock link records every datagram the trunk writes and feeds replies
//! from a queue. The test codec produces structurally valid RADIUS bytes
//! and verifies replies by requiring them to echo the request
//! authenticator, which keeps the "decoded with the authenticator saved at
//! encode time" property observable without real signing.

use crate::codec::{DecodeFail, DecodedReply, EncodeError, PacketCodec};
use crate::link::{LinkFactory, LinkIo};
use crate::request::{Attribute, ProtocolRequest};
use crate::wire;
use rand::Rng;
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

#[derive(Default)]
pub struct MockState {
    /// Datagrams queued for the trunk to read
    pub inbound: VecDeque<Vec<u8>>,
    /// Every datagram the trunk wrote, in order
    pub sent: Vec<Vec<u8>>,
    /// Force the next sends to fail with this kind
    pub send_error: Option<io::ErrorKind>,
    /// Force the next sends to fail with this raw errno
    pub send_raw_error: Option<i32>,
    /// Cap each send at this many bytes (stream-style short write)
    pub short_write: Option<usize>,
    pub write_only: bool,
    pub closed: bool,
}

pub struct MockLink {
    state: Arc<Mutex<MockState>>,
}

impl MockLink {
    pub fn pair() -> (MockLink, Arc<Mutex<MockState>>) {
        let state = Arc::new(Mutex::new(MockState::default()));
        (
            MockLink {
                state: state.clone(),
            },
            state,
        )
    }
}

impl LinkIo for MockLink {
    fn poll_send_ready(&self, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_recv_ready(&self, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.state.lock().unwrap().inbound.is_empty() {
            Poll::Pending
        } else {
            Poll::Ready(Ok(()))
        }
    }

    fn try_send(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        if let Some(kind) = state.send_error {
            return Err(io::Error::from(kind));
        }
        if let Some(code) = state.send_raw_error {
            return Err(io::Error::from_raw_os_error(code));
        }
        let n = state.short_write.map_or(buf.len(), |cap| cap.min(buf.len()));
        state.sent.push(buf[..n].to_vec());
        Ok(n)
    }

    fn try_recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        match state.inbound.pop_front() {
            Some(data) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok(n)
            }
            None => Err(io::Error::from(io::ErrorKind::WouldBlock)),
        }
    }

    fn set_write_only(&mut self) -> io::Result<()> {
        self.state.lock().unwrap().write_only = true;
        Ok(())
    }

    fn shutdown(&mut self) {
        self.state.lock().unwrap().closed = true;
    }
}

/// Hands out mock links and keeps a handle to each generation
pub struct MockFactory {
    pub links: Arc<Mutex<Vec<Arc<Mutex<MockState>>>>>,
    pub fail_connect: Arc<AtomicBool>,
}

impl MockFactory {
    pub fn new() -> Self {
        MockFactory {
            links: Arc::new(Mutex::new(Vec::new())),
            fail_connect: Arc::new(AtomicBool::new(false)),
        }
    }

    /// State handle of the `n`th link ever created
    pub fn link(&self, n: usize) -> Arc<Mutex<MockState>> {
        self.links.lock().unwrap()[n].clone()
    }

    pub fn link_count(&self) -> usize {
        self.links.lock().unwrap().len()
    }
}

impl LinkFactory for MockFactory {
    fn connect(&self) -> io::Result<Box<dyn LinkIo>> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
        }
        let (link, state) = MockLink::pair();
        self.links.lock().unwrap().push(state);
        Ok(Box::new(link))
    }
}

/// Toy codec: header + raw attributes, replies verified by authenticator
/// echo
pub struct TestCodec {
    pub max_size: usize,
}

impl TestCodec {
    pub fn new() -> Self {
        TestCodec { max_size: 4096 }
    }
}

impl PacketCodec for TestCodec {
    fn encode(
        &self,
        request: &mut ProtocolRequest,
        id: u8,
        add_proxy_state: bool,
    ) -> Result<Vec<u8>, EncodeError> {
        if add_proxy_state {
            request.extra.push(Attribute::new(
                wire::ATTR_PROXY_STATE,
                vec![0xde, 0xad, 0xbe, 0xef],
            ));
        }

        let mut data = vec![0u8; wire::HEADER_LENGTH];
        data[0] = request.code;
        data[wire::ID_OFFSET] = id;
        rand::rng().fill(&mut data[wire::AUTH_VECTOR_OFFSET..wire::AUTH_VECTOR_OFFSET + 16]);

        for attr in request.attributes.iter().chain(request.extra.iter()) {
            data.push(attr.attr_type);
            data.push((2 + attr.value.len()) as u8);
            data.extend_from_slice(&attr.value);
        }
        if request.require_message_authenticator {
            data.push(wire::ATTR_MESSAGE_AUTHENTICATOR);
            data.push(18);
            data.extend_from_slice(&[0u8; 16]);
        }

        if data.len() > self.max_size {
            return Err(EncodeError::BufferTooSmall {
                have: self.max_size,
                need: data.len(),
            });
        }

        let len = data.len() as u16;
        data[wire::LENGTH_OFFSET..wire::LENGTH_OFFSET + 2].copy_from_slice(&len.to_be_bytes());
        Ok(data)
    }

    fn decode(
        &self,
        data: &[u8],
        request_authenticator: &[u8; 16],
        require_message_authenticator: bool,
    ) -> Result<DecodedReply, DecodeFail> {
        if data.len() < wire::HEADER_LENGTH {
            return Err(DecodeFail::TooShort(data.len()));
        }
        let declared = wire::packet_ok(data).ok_or(DecodeFail::InvalidLength(data.len()))?;

        if &data[wire::AUTH_VECTOR_OFFSET..wire::AUTH_VECTOR_OFFSET + 16] != request_authenticator
        {
            return Err(DecodeFail::BadSignature);
        }

        let mut attributes = Vec::new();
        let mut has_ma = false;
        let mut offset = wire::HEADER_LENGTH;
        while offset < declared {
            let attr_type = data[offset];
            let attr_len = data[offset + 1] as usize;
            let value = data[offset + 2..offset + attr_len].to_vec();
            offset += attr_len;

            if attr_type == wire::ATTR_MESSAGE_AUTHENTICATOR {
                has_ma = true;
                continue;
            }
            if attr_type == wire::ATTR_PROXY_STATE {
                continue;
            }
            attributes.push(Attribute::new(attr_type, value));
        }

        if require_message_authenticator && !has_ma {
            return Err(DecodeFail::MissingMessageAuthenticator);
        }

        Ok(DecodedReply {
            code: data[0],
            attributes,
            message_authenticator: has_ma,
        })
    }
}

/// Authenticator of a captured request packet
pub fn sent_auth(packet: &[u8]) -> [u8; 16] {
    let mut auth = [0u8; 16];
    auth.copy_from_slice(&packet[wire::AUTH_VECTOR_OFFSET..wire::AUTH_VECTOR_OFFSET + 16]);
    auth
}

/// ID byte of a captured request packet
pub fn sent_id(packet: &[u8]) -> u8 {
    packet[wire::ID_OFFSET]
}

/// Build a reply datagram echoing `auth`, with raw `(type, value)` attributes
pub fn reply(code: u8, id: u8, auth: &[u8; 16], attrs: &[(u8, Vec<u8>)]) -> Vec<u8> {
    let mut data = vec![0u8; wire::HEADER_LENGTH];
    data[0] = code;
    data[wire::ID_OFFSET] = id;
    data[wire::AUTH_VECTOR_OFFSET..wire::AUTH_VECTOR_OFFSET + 16].copy_from_slice(auth);
    for (attr_type, value) in attrs {
        data.push(*attr_type);
        data.push((2 + value.len()) as u8);
        data.extend_from_slice(value);
    }
    let len = data.len() as u16;
    data[wire::LENGTH_OFFSET..wire::LENGTH_OFFSET + 2].copy_from_slice(&len.to_be_bytes());
    data
}

/// Reply to a captured request packet: echoes its ID and authenticator
pub fn reply_to(sent: &[u8], code: u8, attrs: &[(u8, Vec<u8>)]) -> Vec<u8> {
    reply(code, sent_id(sent), &sent_auth(sent), attrs)
}
