//! In-process stand-in for the board's I2C proxy

#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io::{BufRead, BufReader, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use beagle_link::ChannelSettings;

#[derive(Clone, Copy)]
struct Poll {
    address: u8,
    register: u8,
    count: usize,
}

#[derive(Default)]
struct ProxyState {
    registers: Mutex<HashMap<(u8, u8), u8>>,
    missing: Mutex<HashSet<u8>>,
    polls: Mutex<HashMap<u32, Poll>>,
    next_poll_id: AtomicU32,
    requests: Mutex<Vec<String>>,
    command_clients: Mutex<Vec<TcpStream>>,
    poll_clients: Mutex<Vec<TcpStream>>,
}

impl ProxyState {
    fn register(&self, address: u8, register: u8) -> u8 {
        self.registers
            .lock()
            .get(&(address, register))
            .copied()
            .unwrap_or(0)
    }

    fn respond(&self, line: &str) -> String {
        self.requests.lock().push(line.to_string());
        let parts: Vec<&str> = line.split(' ').collect();
        let num = |i: usize| parts.get(i).and_then(|p| p.parse::<u32>().ok());

        match (parts[0], parts.len()) {
            ("ping", 1) => "OK".into(),
            ("get", 3) | ("get", 4) => {
                let (Some(address), Some(register)) = (num(1), num(2)) else {
                    return "ERROR".into();
                };
                let (address, register) = (address as u8, register as u8);
                if self.missing.lock().contains(&address) {
                    return "ERROR".into();
                }
                let count = num(3).unwrap_or(1) as u8;
                (0..count)
                    .map(|i| self.register(address, register + i).to_string())
                    .collect::<Vec<_>>()
                    .join(" ")
            }
            ("set", 4) => match (num(1), num(2), num(3)) {
                (Some(address), Some(register), Some(value)) => {
                    self.registers
                        .lock()
                        .insert((address as u8, register as u8), value as u8);
                    "OK".into()
                }
                _ => "ERROR".into(),
            },
            ("addpoll", 5) => match (num(2), num(3), num(4)) {
                (Some(address), Some(register), Some(count)) => {
                    let id = self.next_poll_id.fetch_add(1, Ordering::SeqCst);
                    self.polls.lock().insert(
                        id,
                        Poll {
                            address: address as u8,
                            register: register as u8,
                            count: count as usize,
                        },
                    );
                    format!("OK {id}")
                }
                _ => "ERROR".into(),
            },
            ("rmpoll", 2) => match num(1).and_then(|id| self.polls.lock().remove(&id)) {
                Some(_) => "OK".into(),
                None => "ERROR".into(),
            },
            _ => "ERROR".into(),
        }
    }

    fn serve(self: Arc<Self>, stream: TcpStream) {
        let Ok(mut writer) = stream.try_clone() else {
            return;
        };
        for line in BufReader::new(stream).lines() {
            let Ok(line) = line else { break };
            let reply = format!("{}\r\n", self.respond(line.trim_end()));
            if writer.write_all(reply.as_bytes()).is_err() {
                break;
            }
        }
    }
}

/// Fake proxy listening on two loopback ports
pub struct FakeProxy {
    pub command_port: u16,
    pub poll_port: u16,
    state: Arc<ProxyState>,
}

impl FakeProxy {
    pub fn start() -> Self {
        let command = TcpListener::bind("127.0.0.1:0").unwrap();
        let poll = TcpListener::bind("127.0.0.1:0").unwrap();
        let command_port = command.local_addr().unwrap().port();
        let poll_port = poll.local_addr().unwrap().port();
        let state = Arc::new(ProxyState {
            next_poll_id: AtomicU32::new(1),
            ..ProxyState::default()
        });

        let command_state = Arc::clone(&state);
        thread::spawn(move || {
            for stream in command.incoming().flatten() {
                if let Ok(clone) = stream.try_clone() {
                    command_state.command_clients.lock().push(clone);
                }
                let handler_state = Arc::clone(&command_state);
                thread::spawn(move || handler_state.serve(stream));
            }
        });

        let poll_state = Arc::clone(&state);
        thread::spawn(move || {
            for stream in poll.incoming().flatten() {
                poll_state.poll_clients.lock().push(stream);
            }
        });

        Self {
            command_port,
            poll_port,
            state,
        }
    }

    pub fn settings(&self) -> ChannelSettings {
        ChannelSettings {
            host: "127.0.0.1".into(),
            command_port: self.command_port,
            poll_port: self.poll_port,
            connect_timeout: Duration::from_secs(1),
            io_timeout: Duration::from_secs(2),
            ..ChannelSettings::default()
        }
    }

    pub fn set_register(&self, address: u8, register: u8, value: u8) {
        self.state
            .registers
            .lock()
            .insert((address, register), value);
    }

    pub fn register(&self, address: u8, register: u8) -> u8 {
        self.state.register(address, register)
    }

    /// Make `address` answer every read with `ERROR`
    pub fn set_missing(&self, address: u8, missing: bool) {
        let mut set = self.state.missing.lock();
        if missing {
            set.insert(address);
        } else {
            set.remove(&address);
        }
    }

    pub fn requests(&self) -> Vec<String> {
        self.state.requests.lock().clone()
    }

    pub fn active_polls(&self) -> usize {
        self.state.polls.lock().len()
    }

    pub fn poll_clients(&self) -> usize {
        self.state.poll_clients.lock().len()
    }

    /// Write a raw line to every poll client
    pub fn push_line(&self, line: &str) {
        let mut clients = self.state.poll_clients.lock();
        clients.retain_mut(|client| client.write_all(line.as_bytes()).is_ok());
    }

    /// Push one reading for every active poll
    pub fn emit_polls(&self) {
        let polls: Vec<(u32, Poll)> = self
            .state
            .polls
            .lock()
            .iter()
            .map(|(&id, &poll)| (id, poll))
            .collect();
        for (id, poll) in polls {
            let line = if self.state.missing.lock().contains(&poll.address) {
                format!("{id}: ERROR\r\n")
            } else {
                let values: Vec<String> = (0..poll.count as u8)
                    .map(|i| self.register(poll.address, poll.register + i).to_string())
                    .collect();
                format!("{id}: {}\r\n", values.join(" "))
            };
            self.push_line(&line);
        }
    }

    /// Drop every client connection, as a proxy restart would
    pub fn kill_connections(&self) {
        for stream in self.state.command_clients.lock().drain(..) {
            let _ = stream.shutdown(Shutdown::Both);
        }
        for stream in self.state.poll_clients.lock().drain(..) {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

/// Poll `condition` until it holds or `timeout` passes
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}
