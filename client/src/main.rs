use clap::Parser;
use client::{RoomConnection, RoomEvent};
use log::{error, info};
use shared::protocol::{encode_packet, ClientPacket, MessageKey};
use shared::schema::{FieldType, FloatWidth, Schema, Value};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Mirror of the demo room's schema; tags must match the server's.
fn demo_schema() -> Arc<Schema> {
    let mut player = Schema::new();
    let _ = player.define_field("x", FieldType::Float(FloatWidth::F64), 0);
    let _ = player.define_field("y", FieldType::Float(FloatWidth::F64), 1);

    let mut message = Schema::new();
    let _ = message.define_field("message", FieldType::String, 0);

    let mut root = Schema::new();
    let _ = root.define_field(
        "players",
        FieldType::Map(Box::new(FieldType::Object(Arc::new(player)))),
        0,
    );
    let _ = root.define_field(
        "messages",
        FieldType::Seq(Box::new(FieldType::Object(Arc::new(message)))),
        1,
    );
    let _ = root.define_field("turn", FieldType::String, 2);
    Arc::new(root)
}

async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let mut buf = vec![0u8; u32::from_le_bytes(len_buf) as usize];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_packet<W: AsyncWrite + Unpin>(writer: &mut W, bytes: &[u8]) -> io::Result<()> {
    writer.write_all(&(bytes.len() as u32).to_le_bytes()).await?;
    writer.write_all(bytes).await?;
    writer.flush().await
}

fn print_state(conn: &RoomConnection) {
    let tree = conn.replica().tree();
    let root = tree.root();
    let turn = match tree.get(root, 2) {
        Some(Value::Str(s)) => s,
        _ => String::new(),
    };
    let mut line = format!("turn={}", turn);
    if let Some(players) = tree.child(root, 0) {
        for key in tree.map_keys(players) {
            if let Some(player) = tree.map_child(players, &key) {
                let x = match tree.get(player, 0) {
                    Some(Value::Float(x)) => x,
                    _ => 0.0,
                };
                line.push_str(&format!("  {}@{:.4}", key, x));
            }
        }
    }
    println!("{}", line);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// Terminal client for the demo room: joins, prints state updates,
    /// lines typed on stdin go out as chat.
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server IP address to connect to
        #[clap(short = 'H', long, default_value = "127.0.0.1")]
        host: String,
        /// Server port
        #[clap(short, long, default_value = "8080")]
        port: u16,
        /// Room type to join
        #[clap(short, long, default_value = "demo")]
        room: String,
    }

    env_logger::init();
    let args = Args::parse();

    let stream = TcpStream::connect((args.host.as_str(), args.port)).await?;
    let (mut read_half, mut write_half) = stream.into_split();

    let join = encode_packet(&ClientPacket::Join {
        room_type: args.room.clone(),
        options: Vec::new(),
    })?;
    write_packet(&mut write_half, &join).await?;

    // Reader task; the channel keeps packet reads whole while the main
    // loop is busy with stdin.
    let (pkt_tx, mut pkt_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    tokio::spawn(async move {
        loop {
            match read_packet(&mut read_half).await {
                Ok(packet) => {
                    if pkt_tx.send(packet).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let mut conn = RoomConnection::new(demo_schema());
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut last_version = 0;

    loop {
        tokio::select! {
            packet = pkt_rx.recv() => {
                let Some(packet) = packet else {
                    info!("connection closed");
                    break;
                };
                match conn.handle(&packet) {
                    Ok(Some(RoomEvent::Joined { session_id })) => {
                        info!("joined {} as {}", args.room, session_id);
                    }
                    Ok(Some(RoomEvent::Message { key, payload })) => {
                        println!("[{}] {}", key, String::from_utf8_lossy(&payload));
                    }
                    Ok(Some(RoomEvent::Kicked { reason })) => {
                        info!("kicked: {}", reason);
                        break;
                    }
                    Ok(None) => {
                        if conn.replica().last_version() != last_version {
                            last_version = conn.replica().last_version();
                            print_state(&conn);
                        }
                    }
                    Err(e) => error!("bad packet: {}", e),
                }
            }
            line = stdin.next_line() => {
                match line? {
                    Some(text) if !text.is_empty() => {
                        let msg = encode_packet(&ClientPacket::AppMessage {
                            key: MessageKey::from("chat"),
                            payload: text.into_bytes(),
                        })?;
                        write_packet(&mut write_half, &msg).await?;
                    }
                    Some(_) => {}
                    None => {
                        let leave = encode_packet(&ClientPacket::Leave)?;
                        write_packet(&mut write_half, &leave).await?;
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}
