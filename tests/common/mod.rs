//! Shared helpers for adoption tests.
#![allow(dead_code)]

use conn_core::{
    Config, Context, HandlerRejected, ProtocolHandler, Session, Slot, SlotEvent,
};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

/// Protocol handler that records every event it sees and can be told to
/// reject the new-connection announcement or received bytes.
pub struct Recording {
    events: Mutex<Vec<String>>,
    pub reject_announce: bool,
    pub reject_receive: bool,
}

impl Recording {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            reject_announce: false,
            reject_receive: false,
        })
    }

    pub fn rejecting_announce() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            reject_announce: true,
            reject_receive: false,
        })
    }

    pub fn rejecting_receive() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            reject_announce: false,
            reject_receive: true,
        })
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl ProtocolHandler for Recording {
    fn new_session(&self) -> Option<Session> {
        Some(Box::new(0u32))
    }

    fn on_event(&self, _slot: &mut Slot, event: SlotEvent<'_>) -> Result<(), HandlerRejected> {
        let label = match &event {
            SlotEvent::Created => "created".to_string(),
            SlotEvent::Destroyed => "destroyed".to_string(),
            SlotEvent::NewClient => "new-client".to_string(),
            SlotEvent::RawAdopted => "raw-adopted".to_string(),
            SlotEvent::Received(data) => format!("recv:{}", String::from_utf8_lossy(data)),
            SlotEvent::Writable => "writable".to_string(),
        };
        self.events.lock().unwrap().push(label);

        match event {
            SlotEvent::NewClient | SlotEvent::RawAdopted if self.reject_announce => {
                Err(HandlerRejected)
            }
            SlotEvent::Received(_) if self.reject_receive => Err(HandlerRejected),
            _ => Ok(()),
        }
    }
}

pub fn make_ctx(threads: usize, fd_limit: usize, peer_ceiling: usize) -> Context {
    Context::new(Config {
        threads,
        fd_limit_per_thread: fd_limit,
        max_connections_per_peer: peer_ceiling,
        ..Config::default()
    })
}

/// A connected (client, accepted-server) TCP pair on loopback.
pub fn stream_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();
    (client, server)
}

pub fn fd_is_closed(fd: RawFd) -> bool {
    unsafe { libc::fcntl(fd, libc::F_GETFD) == -1 }
}
