//! `lunet.socket.tcp()`: cosocket-style TCP and unix stream sockets.
//!
//! ```lua
//! local sock = lunet.socket.tcp()
//! sock:settimeout(1000)
//! local ok, err = sock:connect("127.0.0.1", 6379)
//! sock:send({ "PING", "\r\n" })
//! local line, err, partial = sock:receive("*l")
//! sock:close()
//! ```
//!
//! A socket belongs to the coroutine that created it (see
//! [`Affinity`]). Only one operation of each kind may be in flight; a second
//! one is refused with `socket busy <op>`. `connect`, `send` and `receive`
//! suspend the caller; their completions are committed on the event loop and
//! discarded as `closed` if the socket was closed or reconnected meanwhile.
//!
//! Bytes read past the end of a line stay in a per-socket buffer and serve the
//! next `receive` before any I/O happens.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use mlua::prelude::*;
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

use super::{describe_io_error, flatten_args, port_arg, timeout_arg, Deadline};
use crate::lua::affinity::{Affinity, Generation, ResourceId};
use crate::lua::bridge::{self, closed_values, NO_CONTEXT};
use crate::lua::coroutine::CoroutineId;
use crate::lua::events::ResumeValue;
use crate::lua::state::Bindings;

const READ_CHUNK: usize = 16 * 1024;

/// Connected byte stream.
#[derive(Debug)]
pub(crate) enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

/// Where `connect` goes.
#[derive(Debug, Clone)]
enum Target {
    Inet { host: String, port: u16 },
    #[cfg(unix)]
    Unix(std::path::PathBuf),
}

impl Stream {
    async fn connect(target: Target) -> io::Result<Self> {
        match target {
            Target::Inet { host, port } => {
                let stream = TcpStream::connect((host.as_str(), port)).await?;
                stream.set_nodelay(true)?;
                Ok(Stream::Tcp(stream))
            }
            #[cfg(unix)]
            Target::Unix(path) => Ok(Stream::Unix(UnixStream::connect(path).await?)),
        }
    }

    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let result = match self {
                Stream::Tcp(s) => {
                    s.readable().await?;
                    s.try_read(buf)
                }
                #[cfg(unix)]
                Stream::Unix(s) => {
                    s.readable().await?;
                    s.try_read(buf)
                }
            };
            match result {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                other => return other,
            }
        }
    }

    async fn write_all(&self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            let result = match self {
                Stream::Tcp(s) => {
                    s.writable().await?;
                    s.try_write(data)
                }
                #[cfg(unix)]
                Stream::Unix(s) => {
                    s.writable().await?;
                    s.try_write(data)
                }
            };
            match result {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => data = &data[n..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// How much `receive` reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadMode {
    Line,
    All,
    Size(usize),
}

impl ReadMode {
    fn parse(arg: Option<&LuaValue>) -> Result<Self, &'static str> {
        let size = match arg {
            None | Some(LuaValue::Nil) => return Ok(ReadMode::Line),
            Some(LuaValue::String(s)) => {
                return match &*s.as_bytes() {
                    b"*l" => Ok(ReadMode::Line),
                    b"*a" => Ok(ReadMode::All),
                    _ => Err("bad pattern"),
                }
            }
            Some(LuaValue::Integer(i)) => *i as f64,
            Some(LuaValue::Number(n)) => *n,
            Some(_) => return Err("bad argument"),
        };
        if !size.is_finite() || size < 0.0 {
            return Err("bad number argument");
        }
        Ok(ReadMode::Size(size as usize))
    }
}

/// Result of a network read.
#[derive(Debug, PartialEq, Eq)]
enum Received {
    /// The requested data plus whatever was read past it.
    Data { data: Vec<u8>, rest: Vec<u8> },
    Failed { error: String, partial: Vec<u8> },
}

fn strip_cr(mut line: Vec<u8>) -> Vec<u8> {
    line.retain(|b| *b != b'\r');
    line
}

/// Take one line out of `buf` if it holds a complete one.
fn take_line(buf: &mut Vec<u8>) -> Option<Vec<u8>> {
    let pos = buf.iter().position(|b| *b == b'\n')?;
    let rest = buf.split_off(pos + 1);
    let mut line = std::mem::replace(buf, rest);
    line.pop();
    Some(strip_cr(line))
}

async fn read_line(stream: &Stream, mut acc: Vec<u8>, deadline: Deadline) -> Received {
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = match deadline.run(stream.read(&mut chunk)).await {
            Ok(0) => {
                return Received::Failed {
                    error: "closed".to_string(),
                    partial: strip_cr(acc),
                }
            }
            Ok(n) => n,
            Err(e) => {
                return Received::Failed {
                    error: describe_io_error(&e),
                    partial: strip_cr(acc),
                }
            }
        };
        acc.extend_from_slice(&chunk[..n]);
        if let Some(line) = take_line(&mut acc) {
            return Received::Data {
                data: line,
                rest: acc,
            };
        }
    }
}

async fn read_size(
    stream: &Stream,
    mut acc: Vec<u8>,
    size: usize,
    deadline: Deadline,
) -> Received {
    let mut chunk = vec![0u8; READ_CHUNK.min(size.max(1))];
    while acc.len() < size {
        let want = (size - acc.len()).min(chunk.len());
        match deadline.run(stream.read(&mut chunk[..want])).await {
            Ok(0) => {
                return Received::Failed {
                    error: "closed".to_string(),
                    partial: acc,
                }
            }
            Ok(n) => acc.extend_from_slice(&chunk[..n]),
            Err(e) => {
                return Received::Failed {
                    error: describe_io_error(&e),
                    partial: acc,
                }
            }
        }
    }
    let rest = acc.split_off(size);
    Received::Data { data: acc, rest }
}

async fn read_all(stream: &Stream, mut acc: Vec<u8>, deadline: Deadline) -> Received {
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        match deadline.run(stream.read(&mut chunk)).await {
            Ok(0) => {
                return Received::Data {
                    data: acc,
                    rest: Vec::new(),
                }
            }
            Ok(n) => acc.extend_from_slice(&chunk[..n]),
            Err(e) => {
                return Received::Failed {
                    error: describe_io_error(&e),
                    partial: acc,
                }
            }
        }
    }
}

/// Socket state, owned by the event loop.
#[derive(Debug)]
pub(crate) struct TcpSocket {
    id: ResourceId,
    affinity: Affinity,
    stream: Option<Arc<Stream>>,
    read_buf: Vec<u8>,
    connect_timeout: Option<Duration>,
    send_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    connected: bool,
    closed: bool,
    connecting: bool,
    reading: bool,
    writing: bool,
}

impl TcpSocket {
    fn new(id: ResourceId, affinity: Affinity) -> Self {
        Self {
            id,
            affinity,
            stream: None,
            read_buf: Vec::new(),
            connect_timeout: None,
            send_timeout: None,
            read_timeout: None,
            connected: false,
            closed: false,
            connecting: false,
            reading: false,
            writing: false,
        }
    }

    fn busy(&self, connecting: bool, reading: bool, writing: bool) -> Result<(), &'static str> {
        if connecting && self.connecting {
            return Err("socket busy connecting");
        }
        if reading && self.reading {
            return Err("socket busy reading");
        }
        if writing && self.writing {
            return Err("socket busy writing");
        }
        Ok(())
    }

    /// Drop the connection and invalidate every in-flight completion.
    fn disconnect(&mut self) {
        self.stream = None;
        self.read_buf.clear();
        self.connected = false;
        self.connecting = false;
        self.reading = false;
        self.writing = false;
        self.affinity.invalidate();
    }

    /// Whether a completion started at `generation` may still be applied.
    fn accepts(&self, generation: Generation) -> bool {
        !self.closed && !self.affinity.is_stale(generation)
    }

    /// Refusals shared by every I/O method, in check order.
    fn ready_for_io(&self, caller: Option<CoroutineId>) -> Result<(), &'static str> {
        self.affinity.check(caller)?;
        if self.closed {
            return Err("closed");
        }
        if !self.connected {
            return Err("not connected");
        }
        Ok(())
    }
}

/// The script-visible handle. Lua owns the socket through this userdata.
pub(crate) struct LuaTcpSocket {
    socket: Rc<RefCell<TcpSocket>>,
    bindings: Bindings,
}

impl LuaTcpSocket {
    fn connect(&self, lua: &Lua, args: LuaMultiValue) -> LuaResult<LuaMultiValue> {
        let mut args = args.into_iter();
        let mut sock = self.socket.borrow_mut();
        if let Err(e) = sock.affinity.check(self.bindings.current()) {
            return bridge::failure(lua, e);
        }
        if sock.closed {
            return bridge::failure(lua, "closed");
        }
        if let Err(e) = sock.busy(true, true, true) {
            return bridge::failure(lua, e);
        }

        let host = match args.next() {
            Some(LuaValue::String(s)) => String::from(&*s.to_str()?),
            _ => return bridge::failure(lua, "host must be a string"),
        };
        let target = if let Some(path) = host.strip_prefix("unix:") {
            #[cfg(unix)]
            {
                Target::Unix(std::path::PathBuf::from(path))
            }
            #[cfg(not(unix))]
            {
                let _ = path;
                return bridge::failure(lua, "unix domain sockets are not supported");
            }
        } else {
            match port_arg(args.next().as_ref()) {
                Ok(port) => Target::Inet { host, port },
                Err(e) => return bridge::failure(lua, e),
            }
        };
        let Some(handle) = self.bindings.resume_handle() else {
            return bridge::failure(lua, NO_CONTEXT);
        };

        if sock.connected {
            log::debug!("[tcp] Reconnecting socket {:?}", sock.id);
            sock.disconnect();
        }
        sock.connecting = true;
        let id = sock.id;
        let generation = sock.affinity.generation();
        let deadline = Deadline::after(sock.connect_timeout);
        drop(sock);

        bridge::suspend(&self.bindings, async move {
            match deadline.run(Stream::connect(target)).await {
                Ok(stream) => handle.resume_with(vec![ResumeValue::Int(1)], move |res, values| {
                    let Some(sock) = res.tcp.get(id) else {
                        *values = closed_values();
                        return;
                    };
                    let mut sock = sock.borrow_mut();
                    sock.connecting = false;
                    if !sock.accepts(generation) {
                        *values = closed_values();
                        return;
                    }
                    sock.stream = Some(Arc::new(stream));
                    sock.connected = true;
                }),
                Err(e) => {
                    let error = describe_io_error(&e);
                    log::debug!("[tcp] Connect failed: {error}");
                    handle.resume_with(
                        vec![ResumeValue::Nil, ResumeValue::from(error)],
                        move |res, _| {
                            if let Some(sock) = res.tcp.get(id) {
                                sock.borrow_mut().connecting = false;
                            }
                        },
                    );
                }
            }
        })
    }

    fn send(&self, lua: &Lua, args: LuaMultiValue) -> LuaResult<LuaMultiValue> {
        let mut sock = self.socket.borrow_mut();
        if let Err(e) = sock.ready_for_io(self.bindings.current()) {
            return bridge::failure(lua, e);
        }
        if let Err(e) = sock.busy(true, false, true) {
            return bridge::failure(lua, e);
        }
        if args.is_empty() {
            return bridge::failure(lua, "no data to send");
        }
        let data = match flatten_args(&args) {
            Ok(data) => data,
            Err(e) => return bridge::failure(lua, e),
        };
        let (Some(stream), Some(handle)) =
            (sock.stream.clone(), self.bindings.resume_handle())
        else {
            return bridge::failure(lua, NO_CONTEXT);
        };

        sock.writing = true;
        let id = sock.id;
        let generation = sock.affinity.generation();
        let deadline = Deadline::after(sock.send_timeout);
        drop(sock);

        bridge::suspend(&self.bindings, async move {
            let values = match deadline.run(stream.write_all(&data)).await {
                Ok(()) => vec![ResumeValue::Int(data.len() as i64)],
                Err(e) => vec![ResumeValue::Nil, ResumeValue::from(describe_io_error(&e))],
            };
            handle.resume_with(values, move |res, values| {
                let Some(sock) = res.tcp.get(id) else {
                    *values = closed_values();
                    return;
                };
                let mut sock = sock.borrow_mut();
                sock.writing = false;
                if !sock.accepts(generation) {
                    *values = closed_values();
                }
            });
        })
    }

    fn receive(&self, lua: &Lua, args: LuaMultiValue) -> LuaResult<LuaMultiValue> {
        let mut sock = self.socket.borrow_mut();
        if let Err(e) = sock.ready_for_io(self.bindings.current()) {
            return bridge::failure(lua, e);
        }
        if let Err(e) = sock.busy(true, true, false) {
            return bridge::failure(lua, e);
        }
        let mode = match ReadMode::parse(args.iter().next()) {
            Ok(mode) => mode,
            Err(e) => return bridge::failure(lua, e),
        };

        // Served from the buffer without I/O.
        match mode {
            ReadMode::Size(0) => return lua.create_string("")?.into_lua_multi(lua),
            ReadMode::Line => {
                if let Some(line) = take_line(&mut sock.read_buf) {
                    return lua.create_string(&line)?.into_lua_multi(lua);
                }
            }
            ReadMode::Size(size) if sock.read_buf.len() >= size => {
                let rest = sock.read_buf.split_off(size);
                let data = std::mem::replace(&mut sock.read_buf, rest);
                return lua.create_string(&data)?.into_lua_multi(lua);
            }
            _ => {}
        }

        let (Some(stream), Some(handle)) =
            (sock.stream.clone(), self.bindings.resume_handle())
        else {
            return bridge::failure(lua, NO_CONTEXT);
        };
        let buffered = std::mem::take(&mut sock.read_buf);
        sock.reading = true;
        let id = sock.id;
        let generation = sock.affinity.generation();
        let deadline = Deadline::after(sock.read_timeout);
        drop(sock);

        bridge::suspend(&self.bindings, async move {
            let received = match mode {
                ReadMode::Line => read_line(&stream, buffered, deadline).await,
                ReadMode::All => read_all(&stream, buffered, deadline).await,
                ReadMode::Size(size) => read_size(&stream, buffered, size, deadline).await,
            };
            let (values, rest) = match received {
                Received::Data { data, rest } => (vec![ResumeValue::str(data)], rest),
                Received::Failed { error, partial } => (
                    vec![
                        ResumeValue::Nil,
                        ResumeValue::from(error),
                        ResumeValue::str(partial),
                    ],
                    Vec::new(),
                ),
            };
            handle.resume_with(values, move |res, values| {
                let Some(sock) = res.tcp.get(id) else {
                    *values = closed_values();
                    return;
                };
                let mut sock = sock.borrow_mut();
                sock.reading = false;
                if !sock.accepts(generation) {
                    *values = closed_values();
                    return;
                }
                sock.read_buf = rest;
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
        if let Err(e) = sock.busy(true, true, true) {
            return bridge::failure(lua, e);
        }
        sock.disconnect();
        sock.closed = true;
        log::debug!("[tcp] Closed socket {:?}", sock.id);
        1i64.into_lua_multi(lua)
    }

    fn setkeepalive(&self, lua: &Lua) -> LuaResult<LuaMultiValue> {
        let mut sock = self.socket.borrow_mut();
        if let Err(e) = sock.ready_for_io(self.bindings.current()) {
            return bridge::failure(lua, e);
        }
        if let Err(e) = sock.busy(true, true, true) {
            return bridge::failure(lua, e);
        }
        // No connection pool: the connection is closed, the socket object
        // stays usable for a new connect.
        sock.disconnect();
        1i64.into_lua_multi(lua)
    }

    fn set_timeouts(
        &self,
        lua: &Lua,
        connect: Option<Duration>,
        send: Option<Duration>,
        read: Option<Duration>,
    ) -> LuaResult<LuaMultiValue> {
        let mut sock = self.socket.borrow_mut();
        if let Err(e) = sock.affinity.check(self.bindings.current()) {
            return bridge::failure(lua, e);
        }
        sock.connect_timeout = connect;
        sock.send_timeout = send;
        sock.read_timeout = read;
        1i64.into_lua_multi(lua)
    }
}

impl LuaUserData for LuaTcpSocket {
    fn add_methods<M: LuaUserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("connect", |lua, this, args: LuaMultiValue| {
            this.connect(lua, args)
        });
        methods.add_method("send", |lua, this, args: LuaMultiValue| this.send(lua, args));
        methods.add_method("receive", |lua, this, args: LuaMultiValue| {
            this.receive(lua, args)
        });
        methods.add_method("close", |lua, this, ()| this.close(lua));
        methods.add_method("setkeepalive", |lua, this, _: LuaMultiValue| {
            this.setkeepalive(lua)
        });

        // sock:settimeout(ms) applies to connect, send and receive.
        methods.add_method("settimeout", |lua, this, ms: Option<f64>| {
            let timeout = timeout_arg(ms);
            this.set_timeouts(lua, timeout, timeout, timeout)
        });
        methods.add_method(
            "settimeouts",
            |lua, this, (connect, send, read): (Option<f64>, Option<f64>, Option<f64>)| {
                this.set_timeouts(lua, timeout_arg(connect), timeout_arg(send), timeout_arg(read))
            },
        );
        methods.add_method("getreusedtimes", |_, _, ()| Ok(0));
    }
}

pub(crate) fn register(lua: &Lua, raw: &LuaTable, bindings: &Bindings) -> Result<()> {
    let b = bindings.clone();
    let tcp = lua
        .create_function(move |_, ()| {
            let owner = b
                .current()
                .ok_or_else(|| LuaError::runtime(format!("socket.tcp: {NO_CONTEXT}")))?;
            let socket = b
                .state
                .borrow_mut()
                .resources
                .tcp
                .insert_with(|id| TcpSocket::new(id, Affinity::new(owner)));
            Ok(LuaTcpSocket {
                socket,
                bindings: b.clone(),
            })
        })
        .map_err(|e| anyhow!("Failed to create socket.tcp function: {e}"))?;

    raw.set("tcp", tcp)
        .map_err(|e| anyhow!("Failed to set tcp: {e}"))?;
    Ok(())
}
