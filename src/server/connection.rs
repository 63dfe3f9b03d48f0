use crate::common::models::{AiGroupRequest, NewGroup, NewUser, ProfileUpdate, UserId};
use crate::server::ai_groups::AiGroupPlanner;
use crate::server::config::ServerConfig;
use crate::server::database::Database;
use crate::server::error::{ServiceError, ServiceResult};
use crate::server::groups::GroupService;
use crate::server::notifications::MembershipNotifier;
use crate::server::suggestions::MemberSuggester;
use crate::server::{auth, matching, users};
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::io::BufReader as StdBufReader;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;

// Optional TLS
use rustls::ServerConfig as RustlsConfig;
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use tokio_rustls::TlsAcceptor;

const COMMANDS: &[&str] = &[
    "/register {name,email,password,courses,availability?,year?,bio?}",
    "/login <email> <password>",
    "/logout <token>",
    "/validate_session <token>",
    "/update_profile <token> {name?,availability?,year?,bio?,image_url?,courses?}",
    "/rank_peers <token> [\"course\", ...]",
    "/create_group <token> {name,course,max_members,is_public,invitees}",
    "/create_ai_group <token> {course,max_members,is_public,name?}",
    "/group <token> <group_id>",
    "/my_groups <token>",
    "/course_groups <token> <course>",
    "/join_group <token> <group_id>",
    "/request_join <token> <group_id> [message]",
    "/group_requests <token> <group_id>",
    "/my_requests <token>",
    "/accept_request <token> <group_id> <request_id>",
    "/reject_request <token> <group_id> <request_id>",
    "/leave_group <token> <group_id>",
    "/kick_member <token> <group_id> <user_id>",
    "/rename_group <token> <group_id> <name>",
    "/toggle_visibility <token> <group_id>",
    "/delete_group <token> <group_id>",
    "/help",
    "/quit",
];

pub struct Server {
    pub db: Arc<Database>,
    pub config: ServerConfig,
    pub groups: Arc<GroupService>,
    pub ai_groups: AiGroupPlanner,
}

impl Server {
    pub fn new(
        db: Arc<Database>,
        config: ServerConfig,
        notifier: Arc<dyn MembershipNotifier>,
        suggester: Arc<dyn MemberSuggester>,
    ) -> Self {
        let groups = Arc::new(GroupService::new(db.clone(), notifier));
        let ai_groups = AiGroupPlanner::new(groups.clone(), suggester, config.ai_group_cooldown_secs);
        Self {
            db,
            config,
            groups,
            ai_groups,
        }
    }

    /// Configure TLS acceptor from environment variables
    fn setup_tls_acceptor(&self) -> anyhow::Result<Option<TlsAcceptor>> {
        if !self.config.enable_encryption {
            info!("[TLS] TLS disabled in configuration");
            return Ok(None);
        }

        let cert_path = std::env::var("TLS_CERT_PATH")
            .map_err(|_| anyhow::anyhow!("TLS_CERT_PATH environment variable not set"))?;
        let key_path = std::env::var("TLS_KEY_PATH")
            .map_err(|_| anyhow::anyhow!("TLS_KEY_PATH environment variable not set"))?;
        info!("[TLS] Loading certificate from {} and key from {}", cert_path, key_path);

        let cert_file = File::open(&cert_path)
            .map_err(|e| anyhow::anyhow!("Failed to open certificate file '{}': {}", cert_path, e))?;
        let cert_chain = certs(&mut StdBufReader::new(cert_file))?
            .into_iter()
            .map(rustls::Certificate)
            .collect::<Vec<_>>();
        if cert_chain.is_empty() {
            return Err(anyhow::anyhow!("No certificates found in {}", cert_path));
        }

        let key_file = File::open(&key_path)
            .map_err(|e| anyhow::anyhow!("Failed to open private key file '{}': {}", key_path, e))?;
        // Try PKCS8 first, then RSA
        let mut keys = pkcs8_private_keys(&mut StdBufReader::new(key_file))?;
        if keys.is_empty() {
            keys = rsa_private_keys(&mut StdBufReader::new(File::open(&key_path)?))?;
        }
        if keys.is_empty() {
            return Err(anyhow::anyhow!("No private keys found in {}", key_path));
        }

        let cert_count = cert_chain.len();
        let priv_key = rustls::PrivateKey(keys.remove(0));
        let rustls_cfg = RustlsConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(cert_chain, priv_key)
            .map_err(|e| anyhow::anyhow!("TLS configuration error: {}", e))?;

        info!("[TLS] Loaded {} certificate(s) and private key", cert_count);
        Ok(Some(TlsAcceptor::from(Arc::new(rustls_cfg))))
    }

    pub async fn run(self: Arc<Self>, addr: &str) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!("[CONN] Listening on {} (max {} clients)", addr, self.config.max_clients);

        let tls_acceptor = match self.setup_tls_acceptor() {
            Ok(acceptor) => acceptor,
            Err(e) => {
                warn!("[TLS] TLS configuration failed: {}; falling back to plain TCP", e);
                None
            }
        };
        let slots = Arc::new(Semaphore::new(self.config.max_clients.max(1)));

        loop {
            let (stream, peer) = listener.accept().await?;
            let permit = match slots.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    warn!("[CONN] Refusing {}: client limit reached", peer);
                    let mut stream = stream;
                    let _ = stream.write_all(b"ERR: capacity_exceeded: Server is full, try again later\n").await;
                    continue;
                }
            };
            info!("[CONN] New connection from {}", peer);
            let server = self.clone();
            let acceptor = tls_acceptor.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let result = match acceptor {
                    Some(acceptor) => match acceptor.accept(stream).await {
                        Ok(tls_stream) => server.handle_client(tls_stream, peer).await,
                        Err(e) => {
                            warn!("[TLS] Handshake with {} failed: {}", peer, e);
                            return;
                        }
                    },
                    None => server.handle_client(stream, peer).await,
                };
                if let Err(e) = result {
                    warn!("[CONN] Client error ({}): {}", peer, e);
                }
            });
        }
    }

    async fn handle_client<S>(&self, stream: S, peer: SocketAddr) -> anyhow::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (reader, writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);
        let mut writer = BufWriter::new(writer);
        let mut line = String::new();

        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                info!("[CONN] Client disconnected: {}", peer);
                break;
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let (cmd, rest) = split_token(trimmed);
            // Arguments carry credentials, only the command name is logged
            debug!("[CONN] [{}] {}", peer, cmd);

            if cmd == "/quit" {
                writer.write_all(b"OK: \"Goodbye\"\n").await?;
                writer.flush().await?;
                break;
            }
            let response = self.handle_command(cmd, rest).await;
            writer.write_all(response.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await?;
        }
        Ok(())
    }

    async fn session_user(&self, token: &str) -> ServiceResult<UserId> {
        auth::validate_session(&self.db, token).await
    }

    /// Execute one protocol command and render its single-line reply.
    pub async fn handle_command(&self, cmd: &str, rest: &str) -> String {
        let args: Vec<&str> = rest.split_whitespace().collect();
        match cmd {
            // ACCOUNTS
            "/register" if !rest.is_empty() => reply(
                async {
                    let new_user: NewUser = parse_payload(rest)?;
                    auth::register(&self.db, new_user, &self.config).await
                }
                .await,
            ),
            "/login" if args.len() >= 2 => {
                let (email, password) = split_token(rest);
                reply(auth::login(&self.db, email, password, &self.config).await)
            }
            "/logout" if args.len() == 1 => reply(auth::logout(&self.db, args[0]).await.map(|_| "Logged out")),
            "/validate_session" if args.len() == 1 => reply(
                async {
                    let uid = self.session_user(args[0]).await?;
                    users::find_by_id(&self.db, &uid)
                        .await?
                        .ok_or_else(|| ServiceError::NotFound("User not found".to_string()))
                }
                .await,
            ),
            "/update_profile" if args.len() >= 2 => reply(
                async {
                    let (token, payload) = split_token(rest);
                    let uid = self.session_user(token).await?;
                    let update: ProfileUpdate = parse_payload(payload)?;
                    users::update_profile(&self.db, &uid, update).await
                }
                .await,
            ),

            // MATCHING
            "/rank_peers" if args.len() >= 2 => reply(
                async {
                    let (token, payload) = split_token(rest);
                    let uid = self.session_user(token).await?;
                    let courses: Vec<String> = parse_payload(payload)?;
                    matching::rank_peers(&self.db, &uid, &courses).await
                }
                .await,
            ),

            // GROUPS
            "/create_group" if args.len() >= 2 => reply(
                async {
                    let (token, payload) = split_token(rest);
                    let uid = self.session_user(token).await?;
                    let new_group: NewGroup = parse_payload(payload)?;
                    self.groups.create_group(&uid, new_group).await
                }
                .await,
            ),
            "/create_ai_group" if args.len() >= 2 => reply(
                async {
                    let (token, payload) = split_token(rest);
                    let uid = self.session_user(token).await?;
                    let request: AiGroupRequest = parse_payload(payload)?;
                    self.ai_groups.create_ai_group(&uid, request).await
                }
                .await,
            ),
            "/group" if args.len() == 2 => reply(
                async {
                    self.session_user(args[0]).await?;
                    self.groups.get_group(args[1]).await
                }
                .await,
            ),
            "/my_groups" if args.len() == 1 => reply(
                async {
                    let uid = self.session_user(args[0]).await?;
                    self.groups.list_user_groups(&uid).await
                }
                .await,
            ),
            "/course_groups" if args.len() >= 2 => reply(
                async {
                    self.session_user(args[0]).await?;
                    self.groups.list_course_groups(&args[1..].join(" ")).await
                }
                .await,
            ),
            "/join_group" if args.len() == 2 => reply(
                async {
                    let uid = self.session_user(args[0]).await?;
                    self.groups.join_group(args[1], &uid).await
                }
                .await,
            ),
            "/leave_group" if args.len() == 2 => reply(
                async {
                    let uid = self.session_user(args[0]).await?;
                    self.groups.leave_group(args[1], &uid).await
                }
                .await,
            ),
            "/kick_member" if args.len() == 3 => reply(
                async {
                    let uid = self.session_user(args[0]).await?;
                    self.groups.kick_member(args[1], &uid, args[2]).await
                }
                .await,
            ),
            "/rename_group" if args.len() >= 3 => reply(
                async {
                    let (token, tail) = split_token(rest);
                    let (group_id, name) = split_token(tail);
                    let uid = self.session_user(token).await?;
                    self.groups.rename_group(group_id, &uid, name).await
                }
                .await,
            ),
            "/toggle_visibility" if args.len() == 2 => reply(
                async {
                    let uid = self.session_user(args[0]).await?;
                    self.groups.toggle_visibility(args[1], &uid).await
                }
                .await,
            ),
            "/delete_group" if args.len() == 2 => reply(
                async {
                    let uid = self.session_user(args[0]).await?;
                    self.groups.delete_group(args[1], &uid).await?;
                    Ok::<_, ServiceError>(serde_json::json!({ "deleted": args[1] }))
                }
                .await,
            ),

            // JOIN REQUESTS
            "/request_join" if args.len() >= 2 => reply(
                async {
                    let uid = self.session_user(args[0]).await?;
                    let message = args[2..].join(" ");
                    let message = (!message.is_empty()).then_some(message.as_str());
                    self.groups.request_join(args[1], &uid, message).await
                }
                .await,
            ),
            "/group_requests" if args.len() == 2 => reply(
                async {
                    let uid = self.session_user(args[0]).await?;
                    self.groups.group_requests(args[1], &uid).await
                }
                .await,
            ),
            "/my_requests" if args.len() == 1 => reply(
                async {
                    let uid = self.session_user(args[0]).await?;
                    self.groups.user_requests(&uid).await
                }
                .await,
            ),
            "/accept_request" if args.len() == 3 => reply(
                async {
                    let uid = self.session_user(args[0]).await?;
                    self.groups.accept_request(args[1], &uid, args[2]).await
                }
                .await,
            ),
            "/reject_request" if args.len() == 3 => reply(
                async {
                    let uid = self.session_user(args[0]).await?;
                    self.groups.reject_request(args[1], &uid, args[2]).await
                }
                .await,
            ),

            "/help" => reply(Ok(COMMANDS)),
            _ => "ERR: validation: Unknown or invalid command. Type /help for the list of commands".to_string(),
        }
    }
}

/// Split off the first whitespace-delimited token; the remainder is trimmed.
fn split_token(s: &str) -> (&str, &str) {
    let s = s.trim();
    match s.split_once(char::is_whitespace) {
        Some((head, tail)) => (head, tail.trim()),
        None => (s, ""),
    }
}

fn parse_payload<T: DeserializeOwned>(raw: &str) -> ServiceResult<T> {
    serde_json::from_str(raw).map_err(|e| ServiceError::Validation(format!("Malformed JSON payload: {}", e)))
}

fn reply<T: Serialize>(result: ServiceResult<T>) -> String {
    match result {
        Ok(value) => match serde_json::to_string(&value) {
            Ok(json) => format!("OK: {}", json),
            Err(e) => {
                error!("[CONN] Could not encode reply: {}", e);
                "ERR: storage: Could not encode reply".to_string()
            }
        },
        Err(ServiceError::Storage(inner)) => {
            error!("[CONN] Storage failure: {}", inner);
            "ERR: storage: The request could not be completed, please try again".to_string()
        }
        Err(e) => format!("ERR: {}: {}", e.kind(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_token_keeps_payload_intact() {
        assert_eq!(split_token("tok {\"name\": \"a  b\"}"), ("tok", "{\"name\": \"a  b\"}"));
        assert_eq!(split_token("  tok  "), ("tok", ""));
        assert_eq!(split_token("a@b.edu correct horse battery"), ("a@b.edu", "correct horse battery"));
    }

    #[test]
    fn errors_carry_their_kind() {
        let line = reply::<()>(Err(ServiceError::CapacityExceeded("Group is full".to_string())));
        assert_eq!(line, "ERR: capacity_exceeded: Group is full");
        let line = reply(Ok(vec![1, 2]));
        assert_eq!(line, "OK: [1,2]");
    }

    #[test]
    fn storage_errors_hide_database_detail() {
        let line = reply::<()>(Err(ServiceError::Storage(sqlx::Error::Protocol(
            "no such table: study_groups".to_string(),
        ))));
        assert!(line.starts_with("ERR: storage: "), "{}", line);
        assert!(!line.contains("study_groups"), "{}", line);
    }

    #[test]
    fn name_remainder_keeps_inner_whitespace() {
        let (_, rest) = split_token("tok g1 Late  Night   Crew");
        assert_eq!(split_token(rest), ("g1", "Late  Night   Crew"));
    }
}
