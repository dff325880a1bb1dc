//! Drives one upstream socket, turning it into [`Event`]s.

use std::pin::pin;
use std::time::Duration;

use futures::channel::mpsc;
use futures::{SinkExt, StreamExt, stream};
use irc::codec::{self, ParseResult};
use irc::connection::{self, Security};
use irc::proto::{Message, command, parse};
use irc::{Codec, Connection};
use tokio::time::{self, Instant};

use crate::account::Connect;
use crate::event::Event;
use crate::handler;

/// Silence after which we ping the server.
const PING_INTERVAL: Duration = Duration::from_secs(120);
/// Time the server has to answer our ping.
const PING_TIMEOUT: Duration = Duration::from_secs(60);
const TICK: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub struct Update {
    pub account: String,
    pub handler: handler::Id,
    pub event: Event,
}

enum Input {
    Received(Result<ParseResult, codec::Error>),
    Closed,
    Outgoing(Message),
    Finished,
    Tick,
}

pub async fn run(connect: Connect, sender: mpsc::UnboundedSender<Update>) {
    let Connect {
        account,
        handler,
        target,
        accept_invalid_certs,
        root_cert_path,
        client_cert_path,
        client_key_path,
        outgoing,
    } = connect;

    let emit = |event: Event| {
        if sender
            .unbounded_send(Update {
                account: account.clone(),
                handler,
                event,
            })
            .is_err()
        {
            log::trace!("[{account}] runtime gone, dropping event");
        }
    };

    let security = if target.tls {
        Security::Secured {
            accept_invalid_certs,
            root_cert_path: root_cert_path.as_ref(),
            client_cert_path: client_cert_path.as_ref(),
            client_key_path: client_key_path.as_ref(),
        }
    } else {
        Security::Unsecured
    };

    let config = connection::Config {
        server: &target.host,
        port: target.port,
        security,
    };

    let connection = match Connection::new(config, Codec::new()).await {
        Ok(connection) => connection,
        Err(error) => {
            let error = match error {
                connection::Error::Tls(error) => format!("a TLS error occurred: {error}"),
                error => error.to_string(),
            };
            log::warn!("[{account}] connection to {target} failed: {error}");

            emit(Event::ConnectError(error));
            return;
        }
    };

    log::info!("[{account}] connected to {target} ({handler})");

    let (mut writer, reader) = connection.split();

    let ticker = stream::unfold(time::interval(TICK), |mut interval| async move {
        interval.tick().await;
        Some((Input::Tick, interval))
    });

    let mut input = pin!(stream::select(
        stream::select(
            reader
                .map(Input::Received)
                .chain(stream::once(async { Input::Closed })),
            outgoing
                .map(Input::Outgoing)
                .chain(stream::once(async { Input::Finished })),
        ),
        ticker,
    ));

    let mut last_activity = Instant::now();
    let mut ping_sent = None::<Instant>;

    let reason = loop {
        let Some(input) = input.next().await else {
            break None;
        };

        match input {
            Input::Received(Ok(Ok(message))) => {
                last_activity = Instant::now();
                ping_sent = None;

                emit(Event::DataIn(message));
            }
            Input::Received(Ok(Err(parse::Error::Parse { input, nom }))) => {
                emit(Event::ErrorInfo {
                    error: format!("unparseable line: {nom}"),
                    line: Some(input),
                    fatal: false,
                });
            }
            Input::Received(Ok(Err(parse::Error::Empty))) => {}
            Input::Received(Err(error)) => break Some(error.to_string()),
            Input::Closed => break None,
            Input::Outgoing(message) => {
                if let Err(error) = writer.send(message.clone()).await {
                    break Some(error.to_string());
                }

                emit(Event::DataOut(message));
            }
            // The handler is gone, leftover lines were written
            Input::Finished => {
                log::debug!("[{account}] closing {handler}");
                break None;
            }
            Input::Tick => match ping_sent {
                Some(sent) if sent.elapsed() >= PING_TIMEOUT => {
                    break Some("Ping timeout".to_string());
                }
                Some(_) => {}
                None if last_activity.elapsed() >= PING_INTERVAL => {
                    if let Err(error) = writer.send(command!("PING", target.host.clone())).await {
                        break Some(error.to_string());
                    }
                    ping_sent = Some(Instant::now());
                }
                None => {}
            },
        }
    };

    if let Err(error) = writer.close().await {
        log::debug!("[{account}] error closing connection: {error}");
    }

    emit(Event::SocketClosed(reason));
}
