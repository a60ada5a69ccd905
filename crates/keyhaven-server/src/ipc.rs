use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use keyhaven_core::device::{DeviceCapabilities, PRIMARY_ID};
use keyhaven_core::keys::{
    base64_bytes, EcSignedPreKey, IdentityKey, PreKeyCount, PreKeyResponse, PreKeyState,
};
use keyhaven_core::{
    timestamp_now_millis, AccountId, AccountState, AnonymousAccessKey, AuthenticatedAccount,
    Device, DeviceId, IdentityType, KeysError, ServiceIdentifier,
};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

use crate::server_state::ServerState;
use crate::ServerError;

/// Credentials of a local client acting as one of its devices.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IpcAuth {
    pub account: AccountId,
    pub device: DeviceId,
}

/// Request from a local client to the key daemon.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum IpcRequest {
    /// Remaining one-time prekeys for the caller's device.
    GetKeyCount {
        auth: IpcAuth,
        #[serde(default)]
        identity: Option<String>,
    },
    /// Upload prekeys. Allowed from disabled devices.
    SetKeys {
        auth: IpcAuth,
        #[serde(default)]
        identity: Option<String>,
        keys: PreKeyState,
    },
    /// Fetch a bundle for another account, either authenticated or with the
    /// target's unidentified access key.
    GetDeviceKeys {
        #[serde(default)]
        auth: Option<IpcAuth>,
        #[serde(default, with = "base64_bytes::option")]
        access_key: Option<Vec<u8>>,
        target: ServiceIdentifier,
        device_id: String,
        #[serde(default)]
        pq: bool,
    },
    /// Replace the caller device's signed EC prekey.
    SetSignedKey {
        auth: IpcAuth,
        #[serde(default)]
        identity: Option<String>,
        key: EcSignedPreKey,
    },
    /// Register an account with a single primary device.
    CreateAccount {
        number: String,
        registration_id: u32,
        #[serde(default)]
        pni_registration_id: Option<u32>,
        identity_key: IdentityKey,
        #[serde(default)]
        pni_identity_key: Option<IdentityKey>,
        signed_pre_key: EcSignedPreKey,
        #[serde(default)]
        pni_signed_pre_key: Option<EcSignedPreKey>,
        #[serde(default, with = "base64_bytes::option")]
        unidentified_access_key: Option<Vec<u8>>,
        #[serde(default)]
        unrestricted_unidentified_access: bool,
    },
    /// Get server status.
    GetStatus,
    /// Shut down the server.
    Shutdown,
}

/// Response from the key daemon.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum IpcResponse {
    /// Generic success.
    Ok,
    KeyCount(PreKeyCount),
    Keys(PreKeyResponse),
    /// A freshly registered account.
    Account { uuid: AccountId, pni: AccountId },
    /// Server status.
    Status { uptime_secs: u64, account_count: u64 },
    /// Error with an HTTP-style status code.
    #[serde(rename_all = "camelCase")]
    Error {
        status: u16,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_after_secs: Option<u64>,
    },
}

impl From<KeysError> for IpcResponse {
    fn from(e: KeysError) -> Self {
        Self::Error {
            status: e.status_code(),
            message: e.to_string(),
            retry_after_secs: e.retry_after().map(ceil_secs),
        }
    }
}

fn ceil_secs(d: Duration) -> u64 {
    d.as_secs().saturating_add(u64::from(d.subsec_nanos() > 0))
}

/// Bind the IPC socket, replacing any stale socket file left at `socket_path`.
pub fn bind_ipc_socket(socket_path: &Path) -> Result<UnixListener, ServerError> {
    let _ = std::fs::remove_file(socket_path);
    let listener = UnixListener::bind(socket_path)?;
    tracing::info!(path = %socket_path.display(), "IPC listener started");
    Ok(listener)
}

/// Longest request line accepted, newline excluded. A full upload of 100 EC
/// and 100 PQ keys fits comfortably.
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024;

/// Accept connections forever, reading newline-delimited JSON requests and
/// writing one JSON response line per request.
pub async fn serve(listener: UnixListener, state: Arc<ServerState>, shutdown_tx: mpsc::Sender<()>) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let state = Arc::clone(&state);
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    serve_connection(stream, &state, &shutdown_tx).await;
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "IPC accept error");
            }
        }
    }
}

async fn serve_connection(
    stream: UnixStream,
    state: &Arc<ServerState>,
    shutdown_tx: &mpsc::Sender<()>,
) {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();

    loop {
        line.clear();
        let limit = MAX_REQUEST_BYTES as u64 + 1;
        match (&mut reader).take(limit).read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(error = %e, "IPC read failed");
                break;
            }
        }

        // Without a newline inside the limit the rest of the line is still
        // unread, so the connection cannot be resynchronised.
        let oversized = line.len() > MAX_REQUEST_BYTES && line.last() != Some(&b'\n');
        let response = if oversized {
            tracing::warn!(limit = MAX_REQUEST_BYTES, "IPC request too large, closing connection");
            KeysError::Validation(format!("request exceeds {MAX_REQUEST_BYTES} bytes")).into()
        } else {
            match serde_json::from_slice::<IpcRequest>(&line) {
                Ok(request) => handle_ipc_request(state, request, shutdown_tx).await,
                Err(e) => KeysError::Validation(format!("invalid request: {e}")).into(),
            }
        };

        let mut buf = serde_json::to_vec(&response).unwrap_or_default();
        buf.push(b'\n');
        if let Err(e) = writer.write_all(&buf).await {
            tracing::warn!(error = %e, "failed to write IPC response");
            break;
        }
        if oversized {
            break;
        }
    }
}

async fn handle_ipc_request(
    state: &Arc<ServerState>,
    request: IpcRequest,
    shutdown_tx: &mpsc::Sender<()>,
) -> IpcResponse {
    match request {
        IpcRequest::GetStatus => match state.account_count() {
            Ok(account_count) => IpcResponse::Status {
                uptime_secs: state.uptime_secs(),
                account_count,
            },
            Err(e) => KeysError::from(e).into(),
        },
        IpcRequest::Shutdown => {
            tracing::info!("shutdown requested via IPC");
            let _ = shutdown_tx.send(()).await;
            IpcResponse::Ok
        }
        request => dispatch(state, request)
            .await
            .unwrap_or_else(IpcResponse::from),
    }
}

async fn dispatch(state: &ServerState, request: IpcRequest) -> Result<IpcResponse, KeysError> {
    let service = &state.service;
    match request {
        IpcRequest::GetKeyCount { auth, identity } => {
            let auth = authenticate(state, auth, false).await?;
            let count = service
                .get_status(&auth, IdentityType::from_param(identity.as_deref()))
                .await?;
            Ok(IpcResponse::KeyCount(count))
        }
        IpcRequest::SetKeys {
            auth,
            identity,
            keys,
        } => {
            let auth = authenticate(state, auth, true).await?;
            service
                .set_keys(&auth, &keys, IdentityType::from_param(identity.as_deref()))
                .await?;
            Ok(IpcResponse::Ok)
        }
        IpcRequest::GetDeviceKeys {
            auth,
            access_key,
            target,
            device_id,
            pq,
        } => {
            let auth = match auth {
                Some(auth) => Some(authenticate(state, auth, false).await?),
                None => None,
            };
            let access_key = access_key.map(AnonymousAccessKey::new);
            let bundle = service
                .get_device_keys(auth.as_ref(), access_key.as_ref(), &target, &device_id, pq)
                .await?;
            Ok(IpcResponse::Keys(bundle))
        }
        IpcRequest::SetSignedKey {
            auth,
            identity,
            key,
        } => {
            let auth = authenticate(state, auth, false).await?;
            service
                .set_signed_key(&auth, &key, IdentityType::from_param(identity.as_deref()))
                .await?;
            Ok(IpcResponse::Ok)
        }
        IpcRequest::CreateAccount {
            number,
            registration_id,
            pni_registration_id,
            identity_key,
            pni_identity_key,
            signed_pre_key,
            pni_signed_pre_key,
            unidentified_access_key,
            unrestricted_unidentified_access,
        } => {
            identity_key.validate()?;
            signed_pre_key.validate()?;
            if let Some(ref key) = pni_identity_key {
                key.validate()?;
            }
            if let Some(ref key) = pni_signed_pre_key {
                key.validate()?;
            }

            let now = timestamp_now_millis();
            let mut device = Device::new(PRIMARY_ID, registration_id);
            device.fetches_messages = true;
            device.pni_registration_id = pni_registration_id;
            device.created = now;
            device.last_seen = now;
            device.capabilities = Some(DeviceCapabilities {
                pni: true,
                ..DeviceCapabilities::default()
            });
            device.set_signed_pre_key(IdentityType::Aci, Some(signed_pre_key));
            device.set_signed_pre_key(IdentityType::Pni, pni_signed_pre_key);

            let mut account = AccountState::new(AccountId::random(), AccountId::random(), number);
            account.add_device(device)?;
            account.set_identity_key(IdentityType::Aci, Some(identity_key));
            account.set_identity_key(IdentityType::Pni, pni_identity_key);
            account.set_unidentified_access_key(unidentified_access_key);
            account.set_unrestricted_unidentified_access(unrestricted_unidentified_access);

            let created = service.accounts().create(account).await?;
            let created = created.state()?;
            Ok(IpcResponse::Account {
                uuid: created.uuid(),
                pni: created.phone_number_identifier(),
            })
        }
        IpcRequest::GetStatus | IpcRequest::Shutdown => Err(KeysError::Validation(
            "admin request routed to the key dispatcher".into(),
        )),
    }
}

/// Resolve `auth` to an account and device. Unknown credentials and, unless
/// `allow_disabled`, disabled devices are refused.
async fn authenticate(
    state: &ServerState,
    auth: IpcAuth,
    allow_disabled: bool,
) -> Result<AuthenticatedAccount, KeysError> {
    let account = state
        .service
        .accounts()
        .get_by_account_identifier(&auth.account)
        .await?
        .ok_or(KeysError::Unauthenticated)?;

    let enabled = account
        .state()?
        .device(auth.device)
        .ok_or(KeysError::Unauthenticated)?
        .is_enabled(timestamp_now_millis());
    if !enabled && !allow_disabled {
        tracing::debug!(account = %auth.account, device = auth.device, "refusing disabled device");
        return Err(KeysError::Unauthenticated);
    }
    Ok(AuthenticatedAccount::new(account, auth.device))
}
