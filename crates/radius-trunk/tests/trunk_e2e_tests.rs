//! End-to-end trunk tests over real UDP sockets
//!
//! These tests run a full worker against a scripted upstream on localhost:
//! - request/reply happy path and result-code mapping
//! - retransmission with identical bytes until the upstream answers
//! - status-check probing bringing a connection up before user traffic
//!
//! The codec here is deliberately simple: raw header + raw attributes,
//! replies verified by echoing the request authenticator. Real signing
//! belongs to the embedding server's protocol library.

use radius_trunk::request::ProtocolRequest;
use radius_trunk::{
    Attribute, ClientRequest, Code, DecodeFail, DecodedReply, EncodeError, Mode, PacketCodec,
    ResultCode, RetrySettings, RetryTables, StatusCheckSettings, TrunkConfig, UdpLinkFactory,
    Worker, wire,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;

struct RawCodec;

impl PacketCodec for RawCodec {
    fn encode(
        &self,
        request: &mut ProtocolRequest,
        id: u8,
        add_proxy_state: bool,
    ) -> Result<Vec<u8>, EncodeError> {
        if add_proxy_state {
            request
                .extra
                .push(Attribute::new(wire::ATTR_PROXY_STATE, vec![0, 0, 0, 1]));
        }

        let mut data = vec![0u8; wire::HEADER_LENGTH];
        data[0] = request.code;
        data[wire::ID_OFFSET] = id;
        // A unique authenticator per encode; replies must echo it.
        data[wire::AUTH_VECTOR_OFFSET] = id;
        data[wire::AUTH_VECTOR_OFFSET + 1] = request.code;
        for attr in request.attributes.iter().chain(request.extra.iter()) {
            data.push(attr.attr_type);
            data.push((2 + attr.value.len()) as u8);
            data.extend_from_slice(&attr.value);
        }
        let len = data.len() as u16;
        data[wire::LENGTH_OFFSET..wire::LENGTH_OFFSET + 2].copy_from_slice(&len.to_be_bytes());
        Ok(data)
    }

    fn decode(
        &self,
        data: &[u8],
        request_authenticator: &[u8; 16],
        _require_message_authenticator: bool,
    ) -> Result<DecodedReply, DecodeFail> {
        if data.len() < wire::HEADER_LENGTH {
            return Err(DecodeFail::TooShort(data.len()));
        }
        if &data[wire::AUTH_VECTOR_OFFSET..wire::AUTH_VECTOR_OFFSET + 16] != request_authenticator
        {
            return Err(DecodeFail::BadSignature);
        }
        Ok(DecodedReply {
            code: data[0],
            attributes: vec![],
            message_authenticator: false,
        })
    }
}

fn reply_for(buf: &[u8], code: u8) -> Vec<u8> {
    let mut reply = vec![0u8; wire::HEADER_LENGTH];
    reply[0] = code;
    reply[wire::ID_OFFSET] = buf[wire::ID_OFFSET];
    reply[wire::LENGTH_OFFSET..wire::LENGTH_OFFSET + 2]
        .copy_from_slice(&(wire::HEADER_LENGTH as u16).to_be_bytes());
    reply[wire::AUTH_VECTOR_OFFSET..wire::AUTH_VECTOR_OFFSET + 16]
        .copy_from_slice(&buf[wire::AUTH_VECTOR_OFFSET..wire::AUTH_VECTOR_OFFSET + 16]);
    reply
}

/// Upstream that answers every packet with `code`, after dropping the
/// first `drops` packets. Returns its address and a packet counter.
async fn spawn_upstream(code: u8, drops: usize) -> (SocketAddr, Arc<AtomicUsize>) {
    let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = server.local_addr().unwrap();
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();

    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        while let Ok((n, from)) = server.recv_from(&mut buf).await {
            if n < wire::HEADER_LENGTH {
                continue;
            }
            let count = counter.fetch_add(1, Ordering::SeqCst);
            if count < drops {
                continue;
            }
            let _ = server.send_to(&reply_for(&buf[..n], code), from).await;
        }
    });

    (addr, seen)
}

fn access_request() -> ClientRequest {
    ClientRequest {
        code: Code::AccessRequest.as_u8(),
        priority: 100,
        recv_time: Instant::now(),
        attributes: vec![Attribute::string(1, "testuser")],
        parent_code: None,
    }
}

#[tokio::test]
async fn test_happy_path_access_accept() {
    let (upstream, seen) = spawn_upstream(Code::AccessAccept.as_u8(), 0).await;

    let config = TrunkConfig {
        mode: Mode::Client,
        connections: 1,
        status_check: None,
        ..Default::default()
    };
    config.validate().unwrap();

    let (worker, handle) = Worker::new(
        config,
        Box::new(RawCodec),
        Box::new(UdpLinkFactory::new(upstream)),
    );
    let task = tokio::spawn(worker.run());

    let rcode = tokio::time::timeout(Duration::from_secs(5), handle.submit(access_request()))
        .await
        .expect("answered in time");
    assert_eq!(rcode, ResultCode::Ok);
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    handle.shutdown().await;
    task.await.unwrap();
}

#[tokio::test]
async fn test_retransmit_until_upstream_answers() {
    // Drop the first two copies; the third gets an answer.
    let (upstream, seen) = spawn_upstream(Code::AccessAccept.as_u8(), 2).await;

    let config = TrunkConfig {
        mode: Mode::Client,
        connections: 1,
        status_check: None,
        retry: RetryTables {
            access_request: RetrySettings {
                initial_rt_ms: 200,
                max_rt_ms: 1_000,
                mrc: 5,
                mrd_ms: 10_000,
            },
            ..Default::default()
        },
        ..Default::default()
    };
    config.validate().unwrap();

    let (worker, handle) = Worker::new(
        config,
        Box::new(RawCodec),
        Box::new(UdpLinkFactory::new(upstream)),
    );
    let task = tokio::spawn(worker.run());

    let rcode = tokio::time::timeout(Duration::from_secs(10), handle.submit(access_request()))
        .await
        .expect("answered after retransmits");
    assert_eq!(rcode, ResultCode::Ok);
    assert!(seen.load(Ordering::SeqCst) >= 3);

    handle.shutdown().await;
    task.await.unwrap();
}

#[tokio::test]
async fn test_retry_exhaustion_resumes_fail() {
    // Upstream drops everything.
    let (upstream, seen) = spawn_upstream(Code::AccessAccept.as_u8(), usize::MAX).await;

    let config = TrunkConfig {
        mode: Mode::Client,
        connections: 1,
        status_check: None,
        retry: RetryTables {
            access_request: RetrySettings {
                initial_rt_ms: 100,
                max_rt_ms: 200,
                mrc: 3,
                mrd_ms: 5_000,
            },
            ..Default::default()
        },
        ..Default::default()
    };
    config.validate().unwrap();

    let (worker, handle) = Worker::new(
        config,
        Box::new(RawCodec),
        Box::new(UdpLinkFactory::new(upstream)),
    );
    let task = tokio::spawn(worker.run());

    let rcode = tokio::time::timeout(Duration::from_secs(10), handle.submit(access_request()))
        .await
        .expect("failed within the schedule");
    assert_eq!(rcode, ResultCode::Fail);
    assert_eq!(seen.load(Ordering::SeqCst), 3);

    handle.shutdown().await;
    task.await.unwrap();
}

#[tokio::test]
async fn test_status_checks_gate_user_traffic() {
    // The upstream answers everything, including the Status-Server probe
    // that must succeed before any user packet goes out.
    let (upstream, seen) = spawn_upstream(Code::AccessAccept.as_u8(), 0).await;

    let config = TrunkConfig {
        mode: Mode::Client,
        connections: 1,
        status_check: Some(StatusCheckSettings::default()),
        ..Default::default()
    };
    config.validate().unwrap();

    let (worker, handle) = Worker::new(
        config,
        Box::new(RawCodec),
        Box::new(UdpLinkFactory::new(upstream)),
    );
    let task = tokio::spawn(worker.run());

    let rcode = tokio::time::timeout(Duration::from_secs(5), handle.submit(access_request()))
        .await
        .expect("answered in time");
    assert_eq!(rcode, ResultCode::Ok);
    // At least the probe plus the user request reached the upstream.
    assert!(seen.load(Ordering::SeqCst) >= 2);

    handle.shutdown().await;
    task.await.unwrap();
}

#[tokio::test]
async fn test_reject_maps_to_reject() {
    let (upstream, _seen) = spawn_upstream(Code::AccessReject.as_u8(), 0).await;

    let config = TrunkConfig {
        mode: Mode::Client,
        connections: 1,
        status_check: None,
        ..Default::default()
    };
    let (worker, handle) = Worker::new(
        config,
        Box::new(RawCodec),
        Box::new(UdpLinkFactory::new(upstream)),
    );
    let task = tokio::spawn(worker.run());

    let rcode = tokio::time::timeout(Duration::from_secs(5), handle.submit(access_request()))
        .await
        .expect("answered in time");
    assert_eq!(rcode, ResultCode::Reject);

    handle.shutdown().await;
    task.await.unwrap();
}
