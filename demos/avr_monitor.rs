/**
 * AVR Monitor Example
 *
 * Connects to a Denon/Marantz receiver, switches it on and prints every state
 * change it reports for one minute.
 *
 * Usage: cargo run --example avr_monitor -- <address> [port]
 */
use domolink::codecs::{AvrCodec, AvrCommand};
use domolink::{DeviceBuilder, DeviceEvent};
use futures_util::StreamExt;
use std::time::Duration;

#[tokio::main]
async fn main() {
    env_logger::init();
    println!("--- Domolink - AVR Monitor ---");

    let mut args = std::env::args().skip(1);
    let address = args.next().unwrap_or_else(|| "192.168.1.20".to_string());
    let port = args.next().and_then(|p| p.parse().ok()).unwrap_or(23);

    // 1. Start the device task
    let device = match DeviceBuilder::new("avr", address.as_str(), AvrCodec::default())
        .port(port)
        .heartbeat(Duration::from_secs(10))
        .spawn()
    {
        Ok(device) => device,
        Err(e) => {
            eprintln!("[ERROR] Cannot start device: {}", e);
            return;
        }
    };
    println!("[INFO] Monitoring receiver at {}:{}", address, port);

    // 2. Subscribe before sending anything so no report is missed
    let stream = device.stream();
    tokio::pin!(stream);

    if let Err(e) = device.send(AvrCommand::Power(true)).await {
        eprintln!("[ERROR] Power on rejected: {}", e);
    }

    // 3. Print events until the timeout
    let timeout = tokio::time::sleep(Duration::from_secs(60));
    tokio::pin!(timeout);

    loop {
        tokio::select! {
            Some(event) = stream.next() => match event {
                DeviceEvent::State(field) => println!("[STATE] {}", field),
                DeviceEvent::Reachable(reachable) => println!("[LINK] reachable={}", reachable),
                DeviceEvent::Fault { code, message } => eprintln!("[FAULT] {} ({})", message, code),
            },
            _ = &mut timeout => {
                println!("[INFO] Example timeout reached. Exiting.");
                break;
            }
        }
    }

    println!("[INFO] Final snapshot: {:?}", device.snapshot());
    device.stop().await;
}
