// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! NFS traffic through a real bridge listener.
//!
//! These tests verify:
//! 1. MNT, LOOKUP and READ reach the export through a dialed sub-channel
//! 2. Bridge shutdown leaves nothing listening on the advertised port

use async_trait::async_trait;
use nfsserve::nfs::{diropargs3, nfs_fh3, nfsstring, post_op_attr};
use nfsserve::xdr::XDR;
use sandshell_core::application::fs_bridge::DedicatedListenerBridge;
use sandshell_core::domain::bridge::{
    BoxedDuplex, BridgeEndpoint, BridgeError, FilesystemBridge, SubChannelDialer,
};
use sandshell_core::domain::session::Session;
use sandshell_core::infrastructure::nfs::NfsExport;
use sandshell_core::infrastructure::StreamPipe;
use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const MOUNT_PROGRAM: u32 = 100005;
const NFS_PROGRAM: u32 = 100003;
const MNT: u32 = 1;
const LOOKUP: u32 = 3;
const READ: u32 = 6;

/// Pipes every sub-channel into a local NFS export, as the producer does.
struct ExportDialer {
    export: SocketAddr,
}

#[async_trait]
impl SubChannelDialer for ExportDialer {
    async fn open_fs_channel(&self, _originator: Option<SocketAddr>) -> Result<BoxedDuplex, BridgeError> {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let export = self.export;
        tokio::spawn(async move {
            if let Ok(upstream) = TcpStream::connect(export).await {
                StreamPipe::new().relay(far, upstream).await;
            }
        });
        Ok(Box::pin(near))
    }
}

/// Minimal ONC RPC client speaking record-marked AUTH_NULL calls.
struct RpcClient {
    stream: TcpStream,
    xid: u32,
}

impl RpcClient {
    async fn call(&mut self, prog: u32, proc_: u32, args: &[u8]) -> Cursor<Vec<u8>> {
        self.xid += 1;
        let mut msg = Vec::new();
        for word in [self.xid, 0, 2, prog, 3, proc_] {
            word.serialize(&mut msg).unwrap();
        }
        // cred and verf: AUTH_NULL with an empty body
        for _ in 0..2 {
            0u32.serialize(&mut msg).unwrap();
            Vec::<u8>::new().serialize(&mut msg).unwrap();
        }
        msg.extend_from_slice(args);

        let header = (msg.len() as u32) | (1 << 31);
        self.stream.write_all(&header.to_be_bytes()).await.unwrap();
        self.stream.write_all(&msg).await.unwrap();

        let mut header = [0u8; 4];
        self.stream.read_exact(&mut header).await.unwrap();
        let header = u32::from_be_bytes(header);
        assert!(header & (1 << 31) != 0, "reply split into fragments");
        let mut body = vec![0u8; (header & !(1 << 31)) as usize];
        self.stream.read_exact(&mut body).await.unwrap();

        let mut reply = Cursor::new(body);
        assert_eq!(read_u32(&mut reply), self.xid);
        assert_eq!(read_u32(&mut reply), 1, "not a reply");
        assert_eq!(read_u32(&mut reply), 0, "call denied");
        read_u32(&mut reply);
        let mut verf = Vec::<u8>::new();
        verf.deserialize(&mut reply).unwrap();
        assert_eq!(read_u32(&mut reply), 0, "call not accepted");
        reply
    }
}

fn read_u32(reply: &mut Cursor<Vec<u8>>) -> u32 {
    let mut value = 0u32;
    value.deserialize(reply).unwrap();
    value
}

#[tokio::test]
async fn nfs_calls_cross_dedicated_bridge() {
    let dir = tempfile::TempDir::new().unwrap();
    std::fs::write(dir.path().join("notes.txt"), b"shared over the bridge").unwrap();
    let export = NfsExport::serve(dir.path(), "127.0.0.1:0").await.unwrap();

    let bridge = DedicatedListenerBridge::new(
        "127.0.0.1".to_string(),
        "127.0.0.1".to_string(),
        None,
    );
    let dialer = Arc::new(ExportDialer {
        export: export.local_addr(),
    });
    let active = bridge.open(&Session::new("dev"), dialer).await.unwrap();
    let port = match active.endpoint() {
        BridgeEndpoint::Nfs { port, .. } => *port,
        other => panic!("unexpected endpoint {:?}", other),
    };

    let mut client = RpcClient {
        stream: TcpStream::connect(("127.0.0.1", port)).await.unwrap(),
        xid: 0,
    };

    let mut path = Vec::new();
    b"/".to_vec().serialize(&mut path).unwrap();
    let mut reply = client.call(MOUNT_PROGRAM, MNT, &path).await;
    assert_eq!(read_u32(&mut reply), 0, "mount refused");
    let mut root = nfs_fh3::default();
    root.deserialize(&mut reply).unwrap();

    let mut args = Vec::new();
    diropargs3 {
        dir: root,
        name: nfsstring::from(b"notes.txt".to_vec()),
    }
    .serialize(&mut args)
    .unwrap();
    let mut reply = client.call(NFS_PROGRAM, LOOKUP, &args).await;
    assert_eq!(read_u32(&mut reply), 0, "lookup failed");
    let mut file = nfs_fh3::default();
    file.deserialize(&mut reply).unwrap();
    let mut attrs = post_op_attr::default();
    attrs.deserialize(&mut reply).unwrap();
    match attrs {
        post_op_attr::attributes(attr) => assert_eq!(attr.size, 22),
        post_op_attr::Void => panic!("lookup returned no attributes"),
    }

    let mut args = Vec::new();
    file.serialize(&mut args).unwrap();
    0u64.serialize(&mut args).unwrap();
    1024u32.serialize(&mut args).unwrap();
    let mut reply = client.call(NFS_PROGRAM, READ, &args).await;
    assert_eq!(read_u32(&mut reply), 0, "read failed");
    let mut attrs = post_op_attr::default();
    attrs.deserialize(&mut reply).unwrap();
    assert_eq!(read_u32(&mut reply), 22);
    let mut eof = false;
    eof.deserialize(&mut reply).unwrap();
    let mut data = Vec::<u8>::new();
    data.deserialize(&mut reply).unwrap();
    assert!(eof);
    assert_eq!(data, b"shared over the bridge");

    drop(client);
    let report = active.shutdown().await;
    assert!(report.connections >= 1);
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    export.stop();
}
