//! `lunet.socket.udp()`: connected datagram sockets.
//!
//! `setpeername` and `receive` suspend; `send` is a non-blocking send on the
//! connected socket and never yields. Ownership and staleness follow the same
//! rules as TCP.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use mlua::prelude::*;
use tokio::net::UdpSocket as TokioUdpSocket;
#[cfg(unix)]
use tokio::net::UnixDatagram;

use super::{describe_io_error, flatten_args, port_arg, timeout_arg, Deadline};
use crate::lua::affinity::{Affinity, Generation, ResourceId, Resources};
use crate::lua::bridge::{self, closed_values, NO_CONTEXT};
use crate::lua::events::ResumeValue;
use crate::lua::state::Bindings;

/// Largest datagram `receive` returns, and its default size.
pub(crate) const MAX_DATAGRAM: usize = 65536;

#[derive(Debug)]
pub(crate) enum Datagram {
    Udp(TokioUdpSocket),
    #[cfg(unix)]
    Unix(UnixDatagram),
}

impl Datagram {
    async fn connect_inet(host: &str, port: u16) -> io::Result<Self> {
        let mut last_err = None;
        for addr in tokio::net::lookup_host((host, port)).await? {
            let local = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
            let attempt = async {
                let socket = TokioUdpSocket::bind(local).await?;
                socket.connect(addr).await?;
                Ok::<_, io::Error>(socket)
            };
            match attempt.await {
                Ok(socket) => return Ok(Datagram::Udp(socket)),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("{host}: no addresses found"))
        }))
    }

    #[cfg(unix)]
    fn connect_unix(path: &str) -> io::Result<Self> {
        let socket = UnixDatagram::unbound()?;
        socket.connect(path)?;
        Ok(Datagram::Unix(socket))
    }

    fn try_send(&self, data: &[u8]) -> io::Result<usize> {
        match self {
            Datagram::Udp(s) => s.try_send(data),
            #[cfg(unix)]
            Datagram::Unix(s) => s.try_send(data),
        }
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Datagram::Udp(s) => s.recv(buf).await,
            #[cfg(unix)]
            Datagram::Unix(s) => s.recv(buf).await,
        }
    }
}

#[derive(Debug)]
pub(crate) struct UdpSocket {
    id: ResourceId,
    affinity: Affinity,
    socket: Option<Arc<Datagram>>,
    timeout: Option<Duration>,
    closed: bool,
}

impl UdpSocket {
    fn new(id: ResourceId, affinity: Affinity) -> Self {
        Self {
            id,
            affinity,
            socket: None,
            timeout: None,
            closed: false,
        }
    }

    fn disconnect(&mut self) {
        self.socket = None;
        self.affinity.invalidate();
    }
}

/// Loop-side completion of `setpeername`. A socket closed or re-targeted
/// meanwhile reports `closed` whether or not the connect succeeded.
fn commit_peer(
    res: &mut Resources,
    id: ResourceId,
    generation: Generation,
    socket: Option<Datagram>,
    values: &mut Vec<ResumeValue>,
) {
    let Some(sock) = res.udp.get(id) else {
        *values = closed_values();
        return;
    };
    let mut sock = sock.borrow_mut();
    if sock.closed || sock.affinity.is_stale(generation) {
        *values = closed_values();
        return;
    }
    if let Some(socket) = socket {
        sock.socket = Some(Arc::new(socket));
    }
}

pub(crate) struct LuaUdpSocket {
    socket: Rc<RefCell<UdpSocket>>,
    bindings: Bindings,
}

impl LuaUdpSocket {
    fn setpeername(&self, lua: &Lua, args: LuaMultiValue) -> LuaResult<LuaMultiValue> {
        let mut args = args.into_iter();
        let mut sock = self.socket.borrow_mut();
        if let Err(e) = sock.affinity.check(self.bindings.current()) {
            return bridge::failure(lua, e);
        }
        if sock.closed {
            return bridge::failure(lua, "closed");
        }
        let host = match args.next() {
            Some(LuaValue::String(s)) => String::from(&*s.to_str()?),
            _ => return bridge::failure(lua, "host must be a string"),
        };
        let port = if host.starts_with("unix:") {
            None
        } else {
            match port_arg(args.next().as_ref()) {
                Ok(port) => Some(port),
                Err(e) => return bridge::failure(lua, e),
            }
        };
        let Some(handle) = self.bindings.resume_handle() else {
            return bridge::failure(lua, NO_CONTEXT);
        };

        if sock.socket.is_some() {
            sock.disconnect();
        }
        let id = sock.id;
        let generation = sock.affinity.generation();
        let deadline = Deadline::after(sock.timeout);
        drop(sock);

        bridge::suspend(&self.bindings, async move {
            let connected = match (port, host.strip_prefix("unix:")) {
                (Some(port), _) => deadline.run(Datagram::connect_inet(&host, port)).await,
                #[cfg(unix)]
                (None, Some(path)) => Datagram::connect_unix(path),
                _ => Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "unix domain sockets are not supported",
                )),
            };
            let (values, socket) = match connected {
                Ok(socket) => (vec![ResumeValue::Int(1)], Some(socket)),
                Err(e) => (
                    vec![ResumeValue::Nil, ResumeValue::from(describe_io_error(&e))],
                    None,
                ),
            };
            handle.resume_with(values, move |res, values| {
                commit_peer(res, id, generation, socket, values);
            });
        })
    }

    fn connected(&self, lua: &Lua) -> Result<Arc<Datagram>, LuaResult<LuaMultiValue>> {
        let sock = self.socket.borrow();
        if let Err(e) = sock.affinity.check(self.bindings.current()) {
            return Err(bridge::failure(lua, e));
        }
        if sock.closed {
            return Err(bridge::failure(lua, "closed"));
        }
        sock.socket
            .clone()
            .ok_or_else(|| bridge::failure(lua, "not connected"))
    }

    fn send(&self, lua: &Lua, args: LuaMultiValue) -> LuaResult<LuaMultiValue> {
        let socket = match self.connected(lua) {
            Ok(socket) => socket,
            Err(refusal) => return refusal,
        };
        if args.is_empty() {
            return bridge::failure(lua, "no data to send");
        }
        let data = match flatten_args(&args) {
            Ok(data) => data,
            Err(e) => return bridge::failure(lua, e),
        };
        match socket.try_send(&data) {
            Ok(_) => 1i64.into_lua_multi(lua),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                bridge::failure(lua, "socket busy writing")
            }
            Err(e) => bridge::failure(lua, describe_io_error(&e)),
        }
    }

    fn receive(&self, lua: &Lua, size: Option<f64>) -> LuaResult<LuaMultiValue> {
        let socket = match self.connected(lua) {
            Ok(socket) => socket,
            Err(refusal) => return refusal,
        };
        let size = match size {
            None => MAX_DATAGRAM,
            Some(n) if n.is_finite() && n > 0.0 => (n as usize).min(MAX_DATAGRAM),
            Some(_) => return bridge::failure(lua, "bad size argument"),
        };
        let Some(handle) = self.bindings.resume_handle() else {
            return bridge::failure(lua, NO_CONTEXT);
        };
        let (id, generation, deadline) = {
            let sock = self.socket.borrow();
            (sock.id, sock.affinity.generation(), Deadline::after(sock.timeout))
        };

        bridge::suspend(&self.bindings, async move {
            let mut buf = vec![0u8; size];
            let values = match deadline.run(socket.recv(&mut buf)).await {
                Ok(n) => {
                    buf.truncate(n);
                    vec![ResumeValue::str(buf)]
                }
                Err(e) => vec![ResumeValue::Nil, ResumeValue::from(describe_io_error(&e))],
            };
            handle.resume_with(values, move |res, values| {
                let stale = res.udp.get(id).map_or(true, |sock| {
                    let sock = sock.borrow();
                    sock.closed || sock.affinity.is_stale(generation)
                });
                if stale {
                    *values = closed_values();
                }
            });
        })
    }

    fn close(&self, lua: &Lua) -> LuaResult<LuaMultiValue> {
        let mut sock = self.socket.borrow_mut();
        if let Err(e) = sock.affinity.check(self.bindings.current()) {
            return bridge::failure(lua, e);
        }
        if sock.closed {
            return bridge::failure(lua, "already closed");
        }
        sock.disconnect();
        sock.closed = true;
        log::debug!("[udp] Closed socket {:?}", sock.id);
        1i64.into_lua_multi(lua)
    }
}

impl LuaUserData for LuaUdpSocket {
    fn add_methods<M: LuaUserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("setpeername", |lua, this, args: LuaMultiValue| {
            this.setpeername(lua, args)
        });
        methods.add_method("send", |lua, this, args: LuaMultiValue| this.send(lua, args));
        methods.add_method("receive", |lua, this, size: Option<f64>| {
            this.receive(lua, size)
        });
        methods.add_method("close", |lua, this, ()| this.close(lua));
        methods.add_method("settimeout", |lua, this, ms: Option<f64>| {
            let mut sock = this.socket.borrow_mut();
            if let Err(e) = sock.affinity.check(this.bindings.current()) {
                return bridge::failure(lua, e);
            }
            sock.timeout = timeout_arg(ms);
            1i64.into_lua_multi(lua)
        });
    }
}

pub(crate) fn register(lua: &Lua, raw: &LuaTable, bindings: &Bindings) -> Result<()> {
    let b = bindings.clone();
    let udp = lua
        .create_function(move |_, ()| {
            let owner = b
                .current()
                .ok_or_else(|| LuaError::runtime(format!("socket.udp: {NO_CONTEXT}")))?;
            let socket = b
                .state
                .borrow_mut()
                .resources
                .udp
                .insert_with(|id| UdpSocket::new(id, Affinity::new(owner)));
            Ok(LuaUdpSocket {
                socket,
                bindings: b.clone(),
            })
        })
        .map_err(|e| anyhow!("Failed to create socket.udp function: {e}"))?;

    raw.set("udp", udp)
        .map_err(|e| anyhow!("Failed to set udp: {e}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_datagram_round_trip_with_local_peer() {
        let peer = TokioUdpSocket::bind("127.0.0.1:0").await.expect("bind peer");
        let addr = peer.local_addr().expect("peer addr");

        let socket = Datagram::connect_inet("127.0.0.1", addr.port())
            .await
            .expect("connect");
        assert_eq!(socket.try_send(b"ping").expect("send"), 4);

        let mut buf = [0u8; 16];
        let (n, from) = peer.recv_from(&mut buf).await.expect("peer recv");
        assert_eq!(&buf[..n], b"ping");
        peer.send_to(b"pong", from).await.expect("peer send");

        let n = socket.recv(&mut buf).await.expect("recv");
        assert_eq!(&buf[..n], b"pong");
    }

    #[test]
    fn test_failed_setpeername_on_closed_socket_reports_closed() {
        let mut res = Resources::default();
        let sock = res.udp.insert_with(|id| {
            UdpSocket::new(id, Affinity::new(crate::lua::coroutine::CoroutineId(1)))
        });
        let (id, generation) = {
            let sock = sock.borrow();
            (sock.id, sock.affinity.generation())
        };

        let mut values = vec![ResumeValue::Nil, ResumeValue::from("connection refused")];
        commit_peer(&mut res, id, generation, None, &mut values);
        assert!(matches!(values[1], ResumeValue::Str(ref s) if s == "connection refused"));

        sock.borrow_mut().closed = true;
        commit_peer(&mut res, id, generation, None, &mut values);
        assert!(matches!(values[1], ResumeValue::Str(ref s) if s == "closed"));
        assert!(sock.borrow().socket.is_none());

        drop(sock);
        let mut values = vec![ResumeValue::Int(1)];
        commit_peer(&mut res, id, generation, None, &mut values);
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn test_disconnect_invalidates_generation() {
        let mut table = crate::lua::affinity::ResourceTable::default();
        let sock = table.insert_with(|id| {
            UdpSocket::new(id, Affinity::new(crate::lua::coroutine::CoroutineId(1)))
        });
        let mut sock = sock.borrow_mut();
        let generation = sock.affinity.generation();
        sock.disconnect();
        assert!(sock.affinity.is_stale(generation));
    }
}
