use std::io;
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::Arc;

use futures::channel::mpsc;
use futures::{SinkExt, StreamExt, stream};
use irc::proto::{Command, Message, command};
use irc::{Codec, Connection};
use proxy::client::{Client, Output};
use proxy::login::{self, Login, Registration, Step};
use proxy::reply;
use tokio::net::{TcpListener, TcpStream};

use crate::runtime::{Control, Input, Registry};

pub async fn run(registry: Arc<Registry>, address: &str) -> Result<(), io::Error> {
    let listener = TcpListener::bind(address).await?;

    log::info!("listening on {}", listener.local_addr()?);

    loop {
        match listener.accept().await {
            Ok((tcp, address)) => {
                tokio::spawn(serve(registry.clone(), tcp, address));
            }
            Err(error) => log::warn!("accept failed: {error}"),
        }
    }
}

enum Next {
    Line(Result<irc::codec::ParseResult, irc::codec::Error>),
    Closed,
    Output(Output),
    Stopped,
}

async fn serve(registry: Arc<Registry>, tcp: TcpStream, address: SocketAddr) {
    log::debug!("[{address}] connected");

    let mut connection = Connection::accept(tcp, Codec::new());

    let Some(login) = register(&registry, &mut connection, address).await else {
        if let Err(error) = connection.shutdown().await {
            log::trace!("[{address}] shutdown: {error}");
        }
        return;
    };

    let Some(handle) = registry.account(&login.account) else {
        log::warn!("[{address}] account {} is not running", login.account);
        let _ = connection
            .send(command!("ERROR", "Account is not available"))
            .await;
        return;
    };

    let server = registry.server_name();
    let id = registry.next_client_id();
    let (sender, outputs) = mpsc::unbounded();

    let Login {
        account,
        config,
        subclient,
        nickname,
        capabilities,
    } = login;

    log::info!("[{address}] {id} logged in to {account}");

    handle.send(Input::Attach(Client::new(
        id,
        nickname.clone(),
        subclient.clone(),
        config.subclient(subclient.as_deref()).autoburst,
        capabilities.clone(),
        sender,
    )));

    let (mut writer, reader) = connection.split();

    let mut next = pin!(stream::select(
        reader
            .map(Next::Line)
            .chain(stream::once(async { Next::Closed })),
        outputs
            .map(Next::Output)
            .chain(stream::once(async { Next::Stopped })),
    ));

    let reason = loop {
        let Some(input) = next.next().await else {
            break "Connection closed".to_string();
        };

        let reply = match input {
            Next::Line(Ok(Ok(message))) => match message.command {
                Command::PING(token) => {
                    Some(reply::from_server(&server, command!("PONG", server.clone(), token)))
                }
                Command::CAP(..) => login::capability_after_registration(
                    &server,
                    &nickname,
                    message.command,
                    &capabilities,
                ),
                Command::Unknown(verb, parameters) if verb == "TETHER" => {
                    handle.send(Input::Control(id, Control::parse(&parameters)));
                    None
                }
                _ => {
                    handle.send(Input::Command(id, message));
                    None
                }
            },
            Next::Line(Ok(Err(error))) => {
                log::warn!("[{address}] {error}");
                None
            }
            Next::Line(Err(error)) => break error.to_string(),
            Next::Closed => break "Connection closed".to_string(),
            Next::Output(Output::Message(message)) => Some(message),
            // The ERROR line was queued ahead of it
            Next::Output(Output::Close(reason)) => break reason,
            Next::Stopped => break "Account stopped".to_string(),
        };

        if let Some(reply) = reply {
            if let Err(error) = writer.send(reply).await {
                break error.to_string();
            }
        }
    };

    log::info!("[{address}] {id} disconnected: {reason}");

    handle.send(Input::Detach(id));

    if let Err(error) = writer.close().await {
        log::trace!("[{address}] close: {error}");
    }
}

/// Runs downstream registration until the client logs in or gives up.
async fn register(
    registry: &Registry,
    connection: &mut Connection<Codec>,
    address: SocketAddr,
) -> Option<Login> {
    let mut registration = Registration::new();

    loop {
        let message: Message = match connection.next().await? {
            Ok(Ok(message)) => message,
            Ok(Err(error)) => {
                log::warn!("[{address}] {error}");
                continue;
            }
            Err(error) => {
                log::debug!("[{address}] {error}");
                return None;
            }
        };

        if let Command::PING(token) = &message.command {
            let pong = reply::from_server(
                &registry.server_name(),
                command!("PONG", registry.server_name(), token.clone()),
            );
            connection.send(pong).await.ok()?;
            continue;
        }

        match registration.handle(&registry.config(), message) {
            Step::Continue(replies) => {
                for reply in replies {
                    connection.send(reply).await.ok()?;
                }
            }
            Step::Close(replies, reason) => {
                log::info!("[{address}] registration closed: {reason}");

                for reply in replies {
                    connection.send(reply).await.ok()?;
                }
                connection.send(command!("ERROR", reason)).await.ok()?;

                return None;
            }
            Step::Complete(login) => return Some(login),
        }
    }
}
