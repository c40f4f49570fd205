//! Loopback broker for client tests.
//!
//! Speaks the frame protocol on a local port. It answers opens and, unless
//! told otherwise, acknowledges sends, subscribes and unsubscribes. Every
//! frame it receives is recorded for the test to inspect.

use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use crossbeam_channel as channel;
use mqlight_core::{decode_frame, frame_to_bytes, Frame, QoS, RejectReason};
use parking_lot::Mutex;

use crate::endpoint::Endpoint;

#[derive(Default)]
struct Control {
    connections: Vec<Arc<Mutex<TcpStream>>>,
    manual_acks: bool,
    reject_next_open: Option<RejectReason>,
}

pub(crate) struct TestBroker {
    port: u16,
    control: Arc<Mutex<Control>>,
    frames: channel::Receiver<Frame>,
}

impl TestBroker {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let control = Arc::new(Mutex::new(Control::default()));
        let (tx, frames) = channel::unbounded();

        let accept_control = Arc::clone(&control);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let writer = Arc::new(Mutex::new(stream.try_clone().unwrap()));
                accept_control.lock().connections.push(Arc::clone(&writer));
                let control = Arc::clone(&accept_control);
                let tx = tx.clone();
                thread::spawn(move || serve(stream, writer, control, tx));
            }
        });

        Self { port, control, frames }
    }

    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new("127.0.0.1", self.port, false)
    }

    /// Stop acknowledging sends, subscribes and unsubscribes.
    pub fn manual_acks(&self, manual: bool) {
        self.control.lock().manual_acks = manual;
    }

    pub fn reject_next_open(&self, reason: RejectReason) {
        self.control.lock().reject_next_open = Some(reason);
    }

    pub fn connections(&self) -> usize {
        self.control.lock().connections.len()
    }

    /// Write `frame` on the most recent connection.
    pub fn push(&self, frame: &Frame) {
        let latest = self.control.lock().connections.last().cloned();
        let writer = latest.expect("no connection to push to");
        writer.lock().write_all(&frame_to_bytes(frame).unwrap()).unwrap();
    }

    /// Abruptly close every connection.
    pub fn drop_connections(&self) {
        for writer in self.control.lock().connections.iter() {
            let _ = writer.lock().shutdown(Shutdown::Both);
        }
    }

    /// Wait for a received frame matching `wanted`, skipping others.
    pub fn expect(&self, wanted: impl Fn(&Frame) -> bool) -> Frame {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.frames.recv_timeout(remaining) {
                Ok(frame) if wanted(&frame) => return frame,
                Ok(_) => continue,
                Err(_) => panic!("expected frame not received"),
            }
        }
    }

    /// Whether a matching frame arrives within `wait`.
    pub fn sees(&self, wait: Duration, wanted: impl Fn(&Frame) -> bool) -> bool {
        let deadline = Instant::now() + wait;
        while let Ok(frame) = self
            .frames
            .recv_timeout(deadline.saturating_duration_since(Instant::now()))
        {
            if wanted(&frame) {
                return true;
            }
        }
        false
    }
}

fn serve(
    mut stream: TcpStream,
    writer: Arc<Mutex<TcpStream>>,
    control: Arc<Mutex<Control>>,
    frames: channel::Sender<Frame>,
) {
    let mut inbound = BytesMut::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = match stream.read(&mut chunk) {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        inbound.extend_from_slice(&chunk[..n]);

        while let Ok(Some((frame, used))) = decode_frame(&inbound) {
            let _ = inbound.split_to(used);
            let reply = {
                let mut control = control.lock();
                match &frame {
                    Frame::Open(_) => Some(match control.reject_next_open.take() {
                        Some(reason) => Frame::OpenRejected {
                            reason,
                            message: "refused".into(),
                        },
                        None => Frame::Opened,
                    }),
                    Frame::Send(send) if send.qos == QoS::AtLeastOnce && !control.manual_acks => {
                        Some(Frame::SendAck { id: send.id })
                    }
                    Frame::Subscribe(request) if !control.manual_acks => Some(Frame::SubscribeAck { id: request.id }),
                    Frame::Unsubscribe(request) if !control.manual_acks => {
                        Some(Frame::UnsubscribeAck { id: request.id })
                    }
                    _ => None,
                }
            };
            let closing = matches!(frame, Frame::Close(_));
            let _ = frames.send(frame);
            if let Some(reply) = reply {
                let _ = writer.lock().write_all(&frame_to_bytes(&reply).unwrap());
            }
            if closing {
                let _ = stream.shutdown(Shutdown::Both);
                return;
            }
        }
    }
}
