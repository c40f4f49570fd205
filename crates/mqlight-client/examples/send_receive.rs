//! Send and receive example.
//!
//! Run with: cargo run -p mqlight-client --example send_receive [settings.toml]
//!
//! Subscribes to `example/#`, sends a few messages to `example/hello` and
//! prints them as they come back. Without a settings file the client
//! connects to `amqp://localhost`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam_channel as channel;
use mqlight_client::{
    ClientError, Delivery, DestinationListener, NonBlockingClient, NonBlockingClientListener, Properties,
    QoS, Result, SendOptions, Settings, StopOptions, SubscribeOptions,
};

const MESSAGES: usize = 3;

struct Lifecycle {
    started: channel::Sender<()>,
}

impl NonBlockingClientListener<()> for Lifecycle {
    fn on_started(&self, client: &NonBlockingClient, _context: &()) {
        println!("Started as {} on {:?}", client.id(), client.service());
        let _ = self.started.try_send(());
    }

    fn on_retrying(&self, _client: &NonBlockingClient, _context: &(), error: ClientError) {
        println!("Retrying: {}", error);
    }

    fn on_stopped(&self, _client: &NonBlockingClient, _context: &(), error: Option<ClientError>) {
        match error {
            Some(e) => println!("Stopped: {}", e),
            None => println!("Stopped"),
        }
    }
}

struct Printer {
    received: AtomicUsize,
    done: channel::Sender<()>,
}

impl DestinationListener<&'static str> for Printer {
    fn on_message(&self, _client: &NonBlockingClient, label: &&'static str, delivery: Delivery) {
        println!(
            "[{}] {} -> {:?}",
            label,
            delivery.topic(),
            delivery.payload().as_text().unwrap_or("<binary>")
        );
        if let Err(e) = delivery.confirm() {
            eprintln!("Confirm failed: {}", e);
        }
        if self.received.fetch_add(1, Ordering::SeqCst) + 1 == MESSAGES {
            let _ = self.done.try_send(());
        }
    }
}

fn main() -> Result<()> {
    let settings = match std::env::args().nth(1) {
        Some(path) => Settings::load(path)?,
        None => Settings::parse("[client]\nservice = \"amqp://localhost\"\n")?,
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(settings.log.level.as_str())).init();

    let (started_tx, started) = channel::bounded(1);
    let client = NonBlockingClient::from_settings(&settings, Lifecycle { started: started_tx }, ())?;
    if started.recv_timeout(Duration::from_secs(30)).is_err() {
        eprintln!("Client did not start");
        return Ok(());
    }

    let (done_tx, done) = channel::bounded(1);
    let printer = Printer {
        received: AtomicUsize::new(0),
        done: done_tx,
    };
    let options = SubscribeOptions::new().qos(QoS::AtLeastOnce).auto_confirm(false);
    let subscribed = |_: &NonBlockingClient, _: &&'static str, outcome: Result<()>| match outcome {
        Ok(()) => println!("Subscribed"),
        Err(e) => eprintln!("Subscribe failed: {}", e),
    };
    client.subscribe("example/#", &options, printer, subscribed, "example")?;

    let send_options = SendOptions::new().qos(QoS::AtLeastOnce);
    for n in 0..MESSAGES {
        let sent = move |_: &NonBlockingClient, n: &usize, outcome: Result<()>| {
            if let Err(e) = outcome {
                eprintln!("Send {} failed: {}", n, e);
            }
        };
        let full = client.send(
            "example/hello",
            format!("hello {}", n),
            Properties::new(),
            &send_options,
            sent,
            n,
        )?;
        if full {
            println!("Send buffer full");
        }
    }

    let _ = done.recv_timeout(Duration::from_secs(10));
    let (stopped_tx, stopped) = channel::bounded(1);
    client.stop(
        StopOptions::new().drain(true),
        move |_: &NonBlockingClient, _: &(), _: Result<()>| {
            let _ = stopped_tx.try_send(());
        },
        (),
    );
    let _ = stopped.recv_timeout(Duration::from_secs(10));
    Ok(())
}
