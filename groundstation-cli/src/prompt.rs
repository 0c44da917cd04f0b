//! The interactive operator prompt.
//!
//! Runs on the main thread and talks to the station loop exclusively over
//! the control channel; snapshots come back on per-request reply channels.

use crossbeam_channel::{bounded, Sender};
use groundstation::station::ControlRequest;
use std::io::{self, BufRead, Write};
use std::time::Duration;

const REPLY_TIMEOUT: Duration = Duration::from_secs(3);

const HELP: &str = "\
commands:
  debug <debug|info|warn>   set log verbosity
  status                    show station status
  tx_queue                  show pending uplink commands
  rx                        show the receive buffer
  tx <cmd> [now]            queue an uplink command ('now' = transmit continuously)
  tx_rm <cmd> [all]         remove a queued uplink command
  help                      this text
  quit                      shut the station down and exit";

/// Runs the prompt until EOF or `quit`. Returns after requesting shutdown.
pub fn run(control: &Sender<ControlRequest>, uplink_names: &[String]) {
    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        print!(">> ");
        let _ = io::stdout().flush();
        let line = match lines.next() {
            Some(Ok(line)) => line,
            _ => break, // EOF or read error
        };
        let mut words = line.split_whitespace();
        let command = match words.next() {
            Some(word) => word,
            None => continue,
        };
        let args: Vec<&str> = words.collect();

        match command {
            "debug" => cmd_debug(control, &args),
            "status" => cmd_status(control),
            "tx_queue" => cmd_tx_queue(control),
            "rx" => cmd_rx(control),
            "tx" => cmd_tx(control, &args, uplink_names),
            "tx_rm" => cmd_tx_rm(control, &args),
            "help" => println!("{}", HELP),
            "quit" | "exit" => break,
            other => println!("unknown command: {} (try 'help')", other),
        }
    }

    let _ = control.send(ControlRequest::Shutdown);
}

fn cmd_debug(control: &Sender<ControlRequest>, args: &[&str]) {
    let level = match args.first().map(|s| s.to_ascii_lowercase()).as_deref() {
        Some("debug") | Some("verbose") | Some("on") => log::LevelFilter::Debug,
        Some("info") => log::LevelFilter::Info,
        Some("warn") | Some("warning") => log::LevelFilter::Warn,
        _ => {
            println!("invalid debug setting; choose one of 'debug', 'info', or 'warn'");
            return;
        }
    };
    let _ = control.send(ControlRequest::SetLogLevel(level));
    println!("set debug to: {}", level);
}

fn cmd_status(control: &Sender<ControlRequest>) {
    let (reply, result) = bounded(1);
    let _ = control.send(ControlRequest::Status(reply));
    match result.recv_timeout(REPLY_TIMEOUT) {
        Ok(status) => {
            println!("===================================================================");
            println!("{}", status);
            println!("===================================================================");
        }
        Err(_) => println!("station loop did not answer"),
    }
}

fn cmd_tx_queue(control: &Sender<ControlRequest>) {
    let (reply, result) = bounded(1);
    let _ = control.send(ControlRequest::TxQueue(reply));
    match result.recv_timeout(REPLY_TIMEOUT) {
        Ok(report) => {
            println!("{:?}", report.queue);
            if report.immediate {
                println!("(transmitting first constantly)");
            }
        }
        Err(_) => println!("station loop did not answer"),
    }
}

fn cmd_rx(control: &Sender<ControlRequest>) {
    let (reply, result) = bounded(1);
    let _ = control.send(ControlRequest::RxBuffer(reply));
    match result.recv_timeout(REPLY_TIMEOUT) {
        Ok(buf) => {
            println!("RX buffer (len: {}):", buf.len());
            println!("{}", buf);
        }
        Err(_) => println!("station loop did not answer"),
    }
}

fn cmd_tx(control: &Sender<ControlRequest>, args: &[&str], uplink_names: &[String]) {
    let name = match args.first() {
        Some(name) => (*name).to_string(),
        None => {
            println!("usage: tx <cmd> [now]");
            return;
        }
    };
    let immediate = matches!(args.get(1).copied(), Some("true") | Some("now") | Some("on"));

    let (reply, result) = bounded(1);
    let _ = control.send(ControlRequest::QueueUplink {
        name,
        immediate,
        reply,
    });
    match result.recv_timeout(REPLY_TIMEOUT) {
        Ok(true) => {}
        Ok(false) => {
            println!("invalid uplink command; available:");
            for name in uplink_names {
                println!("  {}", name);
            }
        }
        Err(_) => println!("station loop did not answer"),
    }
}

fn cmd_tx_rm(control: &Sender<ControlRequest>, args: &[&str]) {
    let name = match args.first() {
        Some(name) => (*name).to_string(),
        None => {
            println!("usage: tx_rm <cmd> [all]");
            return;
        }
    };
    let all = args.get(1).copied() == Some("all");

    let (reply, result) = bounded(1);
    let _ = control.send(ControlRequest::CancelUplink { name, all, reply });
    match result.recv_timeout(REPLY_TIMEOUT) {
        Ok(true) => {}
        Ok(false) => println!("command not in queue"),
        Err(_) => println!("station loop did not answer"),
    }
}
