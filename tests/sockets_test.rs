//! Integration tests for `lunet.socket.tcp` and `lunet.socket.udp` against
//! local peers on ephemeral ports.

mod common;

use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, UdpSocket};
use std::thread;
use std::time::Duration;

use common::start_instance;
use lunet::{Request, ResumeValue};

fn with_port(code: &str, port: u16) -> Request {
    Request::source(code).with_args(vec![ResumeValue::Int(i64::from(port))])
}

#[test]
fn test_tcp_line_size_and_all_reads() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
    let port = listener.local_addr().expect("listener addr").port();
    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept");
        let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));
        let mut greeting = String::new();
        reader.read_line(&mut greeting).expect("read greeting");
        let mut stream = stream;
        stream
            .write_all(b"line one\r\nline two\nabcdef")
            .expect("write reply");
        stream.write_all(b"tail").expect("write tail");
        greeting
    });

    let (instance, out) = start_instance();
    instance
        .submit(with_port(
            r#"
            local port = ...
            local sock = lunet.socket.tcp()
            sock:settimeout(5000)
            local ok, err = sock:connect("127.0.0.1", port)
            assert(ok, err)
            lunet.say(sock:send("hello", " ", "server\n"))
            lunet.say(sock:receive("*l"))
            lunet.say(sock:receive())
            lunet.say(sock:receive(6))
            lunet.say(sock:receive("*a"))
            lunet.say(sock:close())
            local closed, cerr = sock:close()
            lunet.say(tostring(closed), " ", cerr)
            "#,
            port,
        ))
        .expect("run");

    assert_eq!(server.join().expect("server thread"), "hello server\n");
    assert_eq!(
        out.contents(),
        "13\nline one\nline two\nabcdef\ntail\n1\nnil already closed\n"
    );
}

#[test]
fn test_tcp_failures_return_nil_and_message() {
    let refused_port = {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
        listener.local_addr().expect("listener addr").port()
    };

    let (instance, out) = start_instance();
    instance
        .submit(with_port(
            r#"
            local port = ...
            local sock = lunet.socket.tcp()
            local ok, err = sock:send("x")
            lunet.say(tostring(ok), " ", err)
            ok, err = sock:receive("*x")
            lunet.say(tostring(ok), " ", err)
            ok, err = sock:connect("127.0.0.1", port)
            lunet.say(tostring(ok), " ", err)
            ok, err = sock:connect("127.0.0.1")
            lunet.say(tostring(ok), " ", err)
            "#,
            refused_port,
        ))
        .expect("run");
    assert_eq!(
        out.contents(),
        "nil not connected\nnil not connected\nnil connection refused\nnil missing port\n"
    );
}

#[test]
fn test_tcp_peer_close_returns_partial_line() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
    let port = listener.local_addr().expect("listener addr").port();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        stream.write_all(b"no newline").expect("write");
    });

    let (instance, out) = start_instance();
    instance
        .submit(with_port(
            r#"
            local sock = lunet.socket.tcp()
            assert(sock:connect("127.0.0.1", ...))
            local line, err, partial = sock:receive("*l")
            lunet.say(tostring(line), " ", err, " ", partial)
            "#,
            port,
        ))
        .expect("run");
    server.join().expect("server thread");
    assert_eq!(out.contents(), "nil closed no newline\n");
}

#[test]
fn test_tcp_read_timeout() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
    let port = listener.local_addr().expect("listener addr").port();
    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept");
        thread::sleep(Duration::from_millis(300));
        drop(stream);
    });

    let (instance, out) = start_instance();
    instance
        .submit(with_port(
            r#"
            local sock = lunet.socket.tcp()
            sock:settimeouts(1000, 1000, 20)
            assert(sock:connect("127.0.0.1", ...))
            local data, err = sock:receive(4)
            lunet.say(tostring(data), " ", err)
            sock:close()
            "#,
            port,
        ))
        .expect("run");
    server.join().expect("server thread");
    assert_eq!(out.contents(), "nil timeout\n");
}

#[test]
fn test_huge_timeouts_mean_no_timeout() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
    let port = listener.local_addr().expect("listener addr").port();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        stream.write_all(b"ok\n").expect("write");
    });

    let (instance, out) = start_instance();
    instance
        .submit(with_port(
            r#"
            local sock = lunet.socket.tcp()
            sock:settimeout(1e300)
            sock:settimeouts(math.huge, 1e300, 1e300)
            assert(sock:connect("127.0.0.1", ...))
            lunet.say(sock:receive("*l"))
            sock:close()
            local udp = lunet.socket.udp()
            lunet.say(udp:settimeout(1e300))
            "#,
            port,
        ))
        .expect("run");
    server.join().expect("server thread");
    assert_eq!(out.contents(), "ok\n1\n");
    assert!(instance.run_string("return 1").is_ok());
}

#[test]
fn test_socket_refuses_foreign_coroutine() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
    let port = listener.local_addr().expect("listener addr").port();
    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept");
        let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));
        let mut line = String::new();
        reader.read_line(&mut line).expect("read line");
        let mut stream = stream;
        write!(stream, "echo:{line}").expect("write echo");
    });

    let (instance, out) = start_instance();
    instance
        .submit(with_port(
            r#"
            local tcp = lunet.socket.tcp()
            assert(tcp:connect("127.0.0.1", ...))
            local udp = lunet.socket.udp()
            local refused = false
            lunet.timer.at(0, function()
                local _, err = tcp:send("x")
                lunet.say("tcp send: ", err)
                _, err = tcp:receive("*l")
                lunet.say("tcp receive: ", err)
                _, err = tcp:close()
                lunet.say("tcp close: ", err)
                _, err = udp:send("x")
                lunet.say("udp send: ", err)
                refused = true
            end)
            while not refused do
                lunet.sleep(0.001)
            end
            -- The owner keeps full use of the socket.
            lunet.say(tcp:send("owner\n"))
            lunet.say(tcp:receive("*l"))
            lunet.say(tcp:close())
            "#,
            port,
        ))
        .expect("run");
    server.join().expect("server thread");
    assert_eq!(
        out.contents(),
        "tcp send: bad request\ntcp receive: bad request\ntcp close: bad request\n\
         udp send: bad request\n6\necho:owner\n1\n"
    );
}

#[test]
fn test_socket_objects_hide_their_native_handle() {
    let (instance, out) = start_instance();
    instance
        .run_string(
            r#"
            local tcp = lunet.socket.tcp()
            local udp = lunet.socket.udp()
            lunet.say(tostring(tcp[1]), " ", tostring(next(tcp)), " ", tostring(next(udp)))
            local ok, err = pcall(tcp.send, {}, "x")
            lunet.say(tostring(ok), " ", tostring(err):find("socket expected", 1, true) ~= nil)
            ok, err = pcall(udp.close, tcp)
            lunet.say(tostring(ok), " ", tostring(err):find("socket expected", 1, true) ~= nil)
            "#,
        )
        .expect("run");
    assert_eq!(out.contents(), "nil nil nil\nfalse true\nfalse true\n");
}

#[test]
fn test_udp_round_trip_and_timeout() {
    let peer = UdpSocket::bind("127.0.0.1:0").expect("bind peer");
    let port = peer.local_addr().expect("peer addr").port();
    let server = thread::spawn(move || {
        let mut buf = [0u8; 64];
        let (n, from) = peer.recv_from(&mut buf).expect("peer recv");
        let mut reply = b"pong:".to_vec();
        reply.extend_from_slice(&buf[..n]);
        peer.send_to(&reply, from).expect("peer send");
    });

    let (instance, out) = start_instance();
    instance
        .submit(with_port(
            r#"
            local udp = lunet.socket.udp()
            assert(udp:setpeername("127.0.0.1", ...))
            lunet.say(udp:send("ping"))
            lunet.say(udp:receive())
            udp:settimeout(20)
            local data, err = udp:receive(16)
            lunet.say(tostring(data), " ", err)
            lunet.say(udp:close())
            local ok, cerr = udp:close()
            lunet.say(tostring(ok), " ", cerr)
            "#,
            port,
        ))
        .expect("run");
    server.join().expect("peer thread");
    assert_eq!(
        out.contents(),
        "1\npong:ping\nnil timeout\n1\nnil already closed\n"
    );
}

#[test]
fn test_udp_send_requires_peer() {
    let (instance, out) = start_instance();
    instance
        .run_string(
            r#"
            local udp = lunet.socket.udp()
            local ok, err = udp:send("x")
            lunet.say(tostring(ok), " ", err)
            ok, err = udp:setpeername("127.0.0.1", 0)
            lunet.say(tostring(ok), " ", err)
            "#,
        )
        .expect("run");
    assert_eq!(out.contents(), "nil not connected\nnil invalid port\n");
}
