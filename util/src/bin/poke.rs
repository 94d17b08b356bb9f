//! Quick diagnostic client: joins a node as a throwaway peer, announces
//! last-seen 0, and prints every record the node replays. Handy for
//! inspecting what a live node holds.

use std::io::{Read, Write};
use std::net::TcpStream;

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use clap::{App, Arg};

use meshmap::net::wire;

fn main() {
    let matches = App::new("poke")
        .about("Dump a meshmap node's contents over the replication protocol")
        .arg(
            Arg::with_name("address")
                .required(true)
                .help("host:port of the node"),
        )
        .arg(
            Arg::with_name("identifier")
                .short("i")
                .long("identifier")
                .default_value("126")
                .help("Identifier to claim on the mesh"),
        )
        .get_matches();

    let address = matches.value_of("address").unwrap();
    let identifier: u8 = matches
        .value_of("identifier")
        .unwrap()
        .parse()
        .expect("Identifier must be a number in 1..=127");

    let mut stream = TcpStream::connect(address).expect("Connection failed");

    let mut welcome = Vec::new();
    wire::write_welcome(&mut welcome, identifier, 0).unwrap();
    stream.write_all(&welcome).expect("Welcome write failed");

    let mut reply = [0u8; wire::WELCOME_SIZE];
    stream.read_exact(&mut reply).expect("Welcome read failed");

    println!(
        "node {} (last modification {})",
        reply[0],
        BigEndian::read_u64(&reply[1..])
    );

    loop {
        let length = match stream.read_u16::<BigEndian>() {
            Ok(length) => length as usize,
            // EOF or reset; either way the dump is over.
            Err(_) => break,
        };

        if length == 0 {
            println!("<heartbeat>");
            continue;
        }

        let mut frame = vec![0u8; length];
        stream.read_exact(&mut frame).expect("Record read failed");

        match wire::read_entry(&frame) {
            Ok(entry) => {
                let key = String::from_utf8_lossy(&entry.key);

                match &entry.value {
                    Some(value) => println!(
                        "{} = {:?} (ts {} by {})",
                        key,
                        String::from_utf8_lossy(value),
                        entry.timestamp,
                        entry.modifier
                    ),
                    None => println!("{} <tombstone> (ts {} by {})", key, entry.timestamp, entry.modifier),
                }
            }
            Err(err) => println!("<undecodable record: {:?}>", err),
        }
    }
}
