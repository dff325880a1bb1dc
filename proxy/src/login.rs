//! Downstream registration: `PASS`, `NICK`, `USER` and capability
//! negotiation until the client can be attached to its account.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;

use irc::proto::{Command, Message, command};
use thiserror::Error;

use crate::client::Capability;
use crate::{config, reply};

pub const MAX_AUTH_ATTEMPTS: usize = 3;

/// `user[/subclient]:password`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub subclient: Option<String>,
    pub password: String,
}

impl FromStr for Credentials {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (user, password) = s.split_once(':').ok_or(Error::MalformedPassword)?;

        let (username, subclient) = match user.split_once('/') {
            Some((username, subclient)) => (username, Some(subclient.to_lowercase())),
            None => (user, None),
        };

        if username.is_empty() {
            return Err(Error::MalformedPassword);
        }

        Ok(Self {
            username: username.to_string(),
            subclient: subclient.filter(|subclient| !subclient.is_empty()),
            password: password.to_string(),
        })
    }
}

/// A registered client, ready to attach.
#[derive(Debug, Clone)]
pub struct Login {
    pub account: String,
    pub config: Arc<config::Account>,
    pub subclient: Option<String>,
    pub nickname: String,
    pub capabilities: HashSet<Capability>,
}

#[derive(Debug)]
pub enum Step {
    /// Send these lines and keep reading.
    Continue(Vec<Message>),
    /// Send these lines and close the connection.
    Close(Vec<Message>, String),
    Complete(Login),
}

#[derive(Debug, Default)]
pub struct Registration {
    credentials: Option<Credentials>,
    nickname: Option<String>,
    username: Option<String>,
    capabilities: HashSet<Capability>,
    negotiating: bool,
    failures: usize,
    hinted: bool,
}

impl Registration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&mut self, config: &config::Config, message: Message) -> Step {
        let server = config.listen.name.as_str();
        let nickname = self.nickname.clone().unwrap_or_else(|| "*".to_string());

        match message.command {
            command @ Command::CAP(..) => {
                let (subcommand, argument) = capability_parameters(command);

                match subcommand.as_str() {
                    "LS" | "LIST" => {
                        self.negotiating |= subcommand == "LS";

                        Step::Continue(vec![capability_reply(
                            server,
                            &nickname,
                            &subcommand,
                            &self.capabilities,
                        )])
                    }
                    "REQ" => {
                        self.negotiating = true;

                        Step::Continue(vec![self.request(
                            server,
                            &nickname,
                            argument.as_deref().unwrap_or_default(),
                        )])
                    }
                    "END" => {
                        self.negotiating = false;
                        self.complete(config)
                    }
                    _ => Step::Continue(vec![reply::numeric(
                        server,
                        410,
                        vec![nickname, subcommand, "Invalid CAP command".into()],
                    )]),
                }
            }
            Command::PASS(password) => match password.parse() {
                Ok(credentials) => {
                    self.credentials = Some(credentials);
                    self.complete(config)
                }
                Err(error) => self.reject(server, nickname, "client", &error),
            },
            Command::NICK(nick) => {
                self.nickname = Some(nick);
                self.complete(config)
            }
            Command::USER(username, _) => {
                self.username = Some(username);
                self.complete(config)
            }
            Command::QUIT(_) => Step::Close(vec![], "Client quit".to_string()),
            command => Step::Continue(vec![reply::numeric(
                server,
                451,
                vec![nickname, command.command(), "You have not registered".into()],
            )]),
        }
    }

    fn request(&mut self, server: &str, nickname: &str, requested: &str) -> Message {
        let changes = requested
            .split_whitespace()
            .map(|cap| match cap.strip_prefix('-') {
                Some(cap) => cap.parse::<Capability>().map(|cap| (false, cap)),
                None => cap.parse::<Capability>().map(|cap| (true, cap)),
            })
            .collect::<Result<Vec<_>, _>>();

        let subcommand = match changes {
            Ok(changes) if !changes.is_empty() => {
                for (enable, cap) in changes {
                    if enable {
                        self.capabilities.insert(cap);
                    } else {
                        self.capabilities.remove(&cap);
                    }
                }
                "ACK"
            }
            _ => "NAK",
        };

        reply::from_server(server, command!("CAP", nickname, subcommand, requested))
    }

    fn complete(&mut self, config: &config::Config) -> Step {
        let server = config.listen.name.as_str();

        let (Some(nickname), Some(_)) = (&self.nickname, &self.username) else {
            return Step::Continue(vec![]);
        };
        let nickname = nickname.clone();

        if self.negotiating {
            return Step::Continue(vec![]);
        }

        let Some(credentials) = self.credentials.take() else {
            if self.hinted {
                return Step::Continue(vec![]);
            }
            self.hinted = true;

            return Step::Continue(vec![reply::from_server(
                server,
                command!(
                    "NOTICE",
                    nickname,
                    "*** Send PASS <user>[/<client>]:<password> to log in"
                ),
            )]);
        };

        match authenticate(config, &credentials) {
            Ok(account) => {
                log::info!(
                    "{} logged in{}",
                    credentials.username,
                    credentials
                        .subclient
                        .as_deref()
                        .map(|subclient| format!(" from {subclient}"))
                        .unwrap_or_default()
                );

                Step::Complete(Login {
                    account: config::normalize_username(&credentials.username),
                    config: account,
                    subclient: credentials.subclient,
                    nickname,
                    capabilities: self.capabilities.clone(),
                })
            }
            Err(Error::Suspended(reason)) => {
                log::info!("{} refused: account suspended", credentials.username);

                let reason = format!("Account suspended: {reason}");

                Step::Close(
                    vec![reply::numeric(server, 465, vec![nickname, reason.clone()])],
                    reason,
                )
            }
            Err(error) => self.reject(server, nickname, &credentials.username, &error),
        }
    }

    /// Every rejected PASS counts toward the attempt limit, whether it
    /// failed to parse or failed to authenticate.
    fn reject(&mut self, server: &str, nickname: String, who: &str, error: &Error) -> Step {
        self.failures += 1;
        log::info!(
            "{who} failed to log in ({}/{MAX_AUTH_ATTEMPTS}): {error}",
            self.failures
        );

        let reply = reply::numeric(server, 464, vec![nickname, error.to_string()]);

        if self.failures >= MAX_AUTH_ATTEMPTS {
            Step::Close(vec![reply], "Too many failed login attempts".to_string())
        } else {
            Step::Continue(vec![reply])
        }
    }
}

pub fn authenticate(
    config: &config::Config,
    credentials: &Credentials,
) -> Result<Arc<config::Account>, Error> {
    let account = config
        .account(&credentials.username)
        .ok_or(Error::UnknownAccount)?;

    if !account.check_password(&credentials.password) {
        return Err(Error::BadPassword);
    }

    if let Some(reason) = &account.suspended {
        return Err(Error::Suspended(reason.clone()));
    }

    Ok(account.clone())
}

/// Subcommand and argument of a client `CAP` line.
pub fn capability_parameters(command: Command) -> (String, Option<String>) {
    let mut parameters = command.parameters().into_iter();

    let subcommand = parameters.next().unwrap_or_default().to_uppercase();

    (subcommand, parameters.next())
}

/// `CAP LS` and `CAP LIST` replies.
pub fn capability_reply(
    server: &str,
    nickname: &str,
    subcommand: &str,
    enabled: &HashSet<Capability>,
) -> Message {
    let list = Capability::ALL
        .iter()
        .filter(|cap| subcommand != "LIST" || enabled.contains(cap))
        .map(Capability::as_str)
        .collect::<Vec<_>>();

    reply::from_server(server, command!("CAP", nickname, subcommand, list.join(" ")))
}

/// Capabilities are fixed once a client is attached, so later requests
/// are refused.
pub fn capability_after_registration(
    server: &str,
    nickname: &str,
    command: Command,
    enabled: &HashSet<Capability>,
) -> Option<Message> {
    let (subcommand, argument) = capability_parameters(command);

    match subcommand.as_str() {
        "LS" | "LIST" => Some(capability_reply(server, nickname, &subcommand, enabled)),
        "REQ" => Some(reply::from_server(
            server,
            command!("CAP", nickname, "NAK", argument.unwrap_or_default()),
        )),
        _ => None,
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Password must be <user>[/<client>]:<password>")]
    MalformedPassword,
    #[error("Password incorrect")]
    UnknownAccount,
    #[error("Password incorrect")]
    BadPassword,
    #[error("Account suspended: {0}")]
    Suspended(String),
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::parser::test::{encode, line};

    fn config() -> config::Config {
        config::Config::parse(
            r#"
            [listen]
            name = "tether.test"

            [accounts.alice]
            password = "hunter2"
            nickname = "alice"

            [accounts.mallory]
            password = "sha256:f52fbd32b2b3b86ff88ef6c490628285f482af15ddcb29541f94bcf526a3f6c7"
            nickname = "mallory"
            suspended = "spamming"
            "#,
        )
        .unwrap()
    }

    fn replies(step: &Step) -> Vec<String> {
        let messages = match step {
            Step::Continue(messages) | Step::Close(messages, _) => messages.clone(),
            Step::Complete(_) => vec![],
        };

        messages.into_iter().map(encode).collect()
    }

    #[test]
    fn credentials() {
        let credentials = "Alice/Phone:pass:word".parse::<Credentials>().unwrap();

        assert_eq!(credentials.username, "Alice");
        assert_eq!(credentials.subclient.as_deref(), Some("phone"));
        assert_eq!(credentials.password, "pass:word");

        assert!("nopassword".parse::<Credentials>().is_err());
        assert!(":pw".parse::<Credentials>().is_err());
        assert_eq!(
            "alice/:pw".parse::<Credentials>().unwrap().subclient,
            None
        );
    }

    #[test]
    fn any_order() {
        let config = config();

        for order in [
            ["PASS alice:hunter2", "NICK bob", "USER bob 0 * :Bob"],
            ["NICK bob", "USER bob 0 * :Bob", "PASS alice:hunter2"],
            ["USER bob 0 * :Bob", "PASS alice:hunter2", "NICK bob"],
        ] {
            let mut registration = Registration::new();

            let steps = order
                .iter()
                .map(|raw| registration.handle(&config, line(raw)))
                .collect::<Vec<_>>();

            let completed = steps
                .iter()
                .filter(|step| matches!(step, Step::Complete(_)))
                .count();
            assert_eq!(completed, 1, "{order:?}");

            let Some(Step::Complete(login)) = steps.last() else {
                panic!("last step must complete: {order:?}");
            };
            assert_eq!(login.account, "alice");
            assert_eq!(login.nickname, "bob");
        }
    }

    #[test]
    fn waits_for_cap_end() {
        let config = config();
        let mut registration = Registration::new();

        let ls = registration.handle(&config, line("CAP LS 302"));
        assert_eq!(
            replies(&ls),
            vec![
                ":tether.test CAP * LS :batch server-time znc.in/server-time-iso extended-join multi-prefix userhost-in-names message-tags tether.irc/no-playback"
            ]
        );

        for raw in ["PASS alice:hunter2", "NICK bob", "USER bob 0 * :Bob"] {
            assert!(matches!(
                registration.handle(&config, line(raw)),
                Step::Continue(_)
            ));
        }

        let req = registration.handle(&config, line("CAP REQ :server-time batch"));
        assert_eq!(replies(&req), vec![":tether.test CAP bob ACK :server-time batch"]);

        let nak = registration.handle(&config, line("CAP REQ :server-time sasl"));
        assert_eq!(replies(&nak), vec![":tether.test CAP bob NAK :server-time sasl"]);

        let Step::Complete(login) = registration.handle(&config, line("CAP END")) else {
            panic!("expected completion");
        };
        assert_eq!(
            login.capabilities,
            HashSet::from([Capability::ServerTime, Capability::Batch])
        );
    }

    #[test]
    fn attempts_are_bounded() {
        let config = config();
        let mut registration = Registration::new();

        registration.handle(&config, line("NICK bob"));
        registration.handle(&config, line("USER bob 0 * :Bob"));

        for _ in 1..MAX_AUTH_ATTEMPTS {
            let step = registration.handle(&config, line("PASS alice:wrong"));
            assert!(matches!(step, Step::Continue(_)));
            assert_eq!(replies(&step), vec![":tether.test 464 bob :Password incorrect"]);
        }

        let step = registration.handle(&config, line("PASS nobody:wrong"));
        assert!(matches!(step, Step::Close(..)));
    }

    #[test]
    fn malformed_passwords_count_as_attempts() {
        let config = config();
        let mut registration = Registration::new();

        for _ in 1..MAX_AUTH_ATTEMPTS {
            let step = registration.handle(&config, line("PASS nocolon"));
            assert!(matches!(step, Step::Continue(_)));
            assert_eq!(
                replies(&step),
                vec![":tether.test 464 * :Password must be <user>[/<client>]:<password>"]
            );
        }

        let step = registration.handle(&config, line("PASS :pw"));
        assert!(matches!(step, Step::Close(..)));
    }

    #[test]
    fn malformed_and_wrong_passwords_share_the_limit() {
        let config = config();
        let mut registration = Registration::new();

        registration.handle(&config, line("NICK bob"));
        registration.handle(&config, line("USER bob 0 * :Bob"));

        let step = registration.handle(&config, line("PASS nocolon"));
        assert!(matches!(step, Step::Continue(_)));
        let step = registration.handle(&config, line("PASS alice:wrong"));
        assert!(matches!(step, Step::Continue(_)));

        let step = registration.handle(&config, line("PASS nocolon"));
        assert!(matches!(
            &step,
            Step::Close(_, reason) if reason == "Too many failed login attempts"
        ));
    }

    #[test]
    fn suspended() {
        let config = config();
        let mut registration = Registration::new();

        registration.handle(&config, line("NICK m"));
        registration.handle(&config, line("USER m 0 * :M"));

        let step = registration.handle(&config, line("PASS mallory:hunter2"));

        assert!(matches!(step, Step::Close(..)));
        assert_eq!(
            replies(&step),
            vec![":tether.test 465 m :Account suspended: spamming"]
        );
    }

    #[test]
    fn not_registered() {
        let config = config();
        let mut registration = Registration::new();

        let step = registration.handle(&config, line("JOIN #rust"));

        assert_eq!(
            replies(&step),
            vec![":tether.test 451 * JOIN :You have not registered"]
        );
    }
}
