//! In-memory relay network for integration tests
//!
//! Plays the relay side of the cell protocol over in-process pipes:
//! create/extend handshakes with real onion crypto, stream opens, data
//! echo and SENDME emission. One session task emulates a whole relay
//! chain, since every extend tunnels through the entry connection.
//!
//! Behavior knobs let tests refuse stream opens at chosen exits,
//! swallow CONNECTED replies, or destroy live circuits from the relay
//! side.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, WriteHalf};
use tokio::sync::mpsc;

use tor_circuits::protocol::cell::{Cell, CellCommand, CircIdWidth, RelayCell, RelayCommand};
use tor_circuits::protocol::crypto::{derive_fast, HopCryptState, HopKeyMaterial};
use tor_circuits::protocol::handshake::{ntor_server_handshake, parse_extend2};
use tor_circuits::{
    CellLink, ChannelTransport, CircuitManager, CircuitManagerConfig, ExitPolicy, Relay,
    RelayFlags, StaticDirectory, TorError,
};

const WIDTH: CircIdWidth = CircIdWidth::Four;

/// Route crate logs to the test harness (`RUST_LOG=debug` to see them).
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Reason used when a test destroys circuits from the relay side.
pub const TEST_DESTROY_REASON: u8 = 3; // REQUESTED

/// Declarative description of one emulated relay.
pub struct RelaySpec {
    pub nickname: &'static str,
    pub flags: &'static str,
    pub policy: &'static [&'static str],
}

impl RelaySpec {
    pub fn guard(nickname: &'static str) -> Self {
        Self {
            nickname,
            flags: "Fast Guard Running Stable Valid",
            policy: &["reject *:*"],
        }
    }

    pub fn middle(nickname: &'static str) -> Self {
        Self {
            nickname,
            flags: "Fast Running Stable Valid",
            policy: &["reject *:*"],
        }
    }

    pub fn exit(nickname: &'static str, policy: &'static [&'static str]) -> Self {
        Self {
            nickname,
            flags: "Exit Fast Running Stable Valid",
            policy,
        }
    }
}

/// Behavior knobs shared by every session.
#[derive(Default)]
pub struct NetBehavior {
    /// Swallow BEGIN/BEGIN_DIR instead of replying CONNECTED.
    pub drop_connected: AtomicBool,
    /// Exits (by fingerprint) answering every BEGIN with END.
    pub failing_exits: Mutex<HashSet<String>>,
    /// Echo RELAY_DATA back on the same stream (on by default).
    pub echo_data: AtomicBool,
}

enum NetCommand {
    DestroyCircuits { reason: u8 },
}

/// The emulated network: relays, their onion secrets, live sessions.
pub struct TestNet {
    relays: Vec<Arc<Relay>>,
    onion_secrets: HashMap<String, [u8; 32]>,
    pub behavior: Arc<NetBehavior>,
    sessions: Mutex<Vec<mpsc::UnboundedSender<NetCommand>>>,
}

impl TestNet {
    pub fn new(specs: &[RelaySpec]) -> Arc<Self> {
        let mut relays = Vec::new();
        let mut onion_secrets = HashMap::new();

        for (i, spec) in specs.iter().enumerate() {
            let mut secret = [0u8; 32];
            OsRng.fill_bytes(&mut secret);
            let public =
                x25519_dalek::PublicKey::from(&x25519_dalek::StaticSecret::from(secret));

            let mut hasher = Sha1::new();
            hasher.update(spec.nickname.as_bytes());
            let fingerprint = hex::encode_upper(hasher.finalize());

            let relay = Relay {
                nickname: spec.nickname.to_string(),
                fingerprint: fingerprint.clone(),
                address: Ipv4Addr::new(10, 0, 0, (i + 1) as u8),
                or_port: 9001,
                dir_port: Some(9030),
                flags: RelayFlags::from_string(spec.flags),
                bandwidth: 1_000_000,
                ntor_onion_key: Some(STANDARD.encode(public.as_bytes())),
                family: Vec::new(),
                exit_policy: ExitPolicy::parse(spec.policy).unwrap(),
            };
            onion_secrets.insert(fingerprint, secret);
            relays.push(Arc::new(relay));
        }

        let behavior = NetBehavior {
            echo_data: AtomicBool::new(true),
            ..NetBehavior::default()
        };

        Arc::new(Self {
            relays,
            onion_secrets,
            behavior: Arc::new(behavior),
            sessions: Mutex::new(Vec::new()),
        })
    }

    pub fn relay(&self, nickname: &str) -> Arc<Relay> {
        self.relays
            .iter()
            .find(|r| r.nickname == nickname)
            .cloned()
            .expect("unknown test relay")
    }

    pub fn directory(&self) -> Arc<StaticDirectory> {
        Arc::new(StaticDirectory::new(
            self.relays.iter().map(|r| (**r).clone()).collect(),
        ))
    }

    pub fn transport(self: &Arc<Self>) -> Box<dyn ChannelTransport> {
        Box::new(TestTransport {
            net: Arc::clone(self),
        })
    }

    /// Convenience: a manager wired to this network.
    pub fn manager(self: &Arc<Self>, config: CircuitManagerConfig) -> Arc<CircuitManager> {
        CircuitManager::new(config, self.directory(), self.transport()).unwrap()
    }

    /// Mark an exit as refusing all stream opens.
    pub fn fail_begins_at(&self, nickname: &str) {
        let fp = self.relay(nickname).fingerprint.clone();
        self.behavior.failing_exits.lock().unwrap().insert(fp);
    }

    /// Destroy every live circuit from the relay side.
    pub fn destroy_all_circuits(&self) {
        for session in self.sessions.lock().unwrap().iter() {
            let _ = session.send(NetCommand::DestroyCircuits {
                reason: TEST_DESTROY_REASON,
            });
        }
    }
}

struct TestTransport {
    net: Arc<TestNet>,
}

#[async_trait]
impl ChannelTransport for TestTransport {
    async fn connect(&self, relay: &Relay) -> tor_circuits::Result<Box<dyn CellLink>> {
        if !self.net.onion_secrets.contains_key(&relay.fingerprint) {
            return Err(TorError::ConnectionFailed(format!(
                "no route to {}",
                relay.nickname
            )));
        }
        let (client_end, server_end) = tokio::io::duplex(1 << 20);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        self.net.sessions.lock().unwrap().push(cmd_tx);

        let net = Arc::clone(&self.net);
        let entry_fp = relay.fingerprint.clone();
        tokio::spawn(run_session(net, entry_fp, server_end, cmd_rx));
        Ok(Box::new(client_end))
    }
}

/// One hop of an emulated chain: the relay's view of the shared keys.
struct ServerHop {
    fingerprint: String,
    forward: HopCryptState,
    backward: HopCryptState,
}

struct Chain {
    hops: Vec<ServerHop>,
    circuit_deliver: u32,
    stream_deliver: HashMap<u16, u32>,
}

impl Chain {
    fn new() -> Self {
        Self {
            hops: Vec::new(),
            circuit_deliver: 0,
            stream_deliver: HashMap::new(),
        }
    }

    fn push_hop(&mut self, fingerprint: String, km: &HopKeyMaterial) {
        self.hops.push(ServerHop {
            fingerprint,
            forward: HopCryptState::new(&km.forward_key, &km.forward_digest_seed),
            backward: HopCryptState::new(&km.backward_key, &km.backward_digest_seed),
        });
    }
}

type Writer = WriteHalf<DuplexStream>;

async fn write_cell(writer: &mut Writer, cell: &Cell) -> Result<(), ()> {
    let bytes = cell.to_bytes(WIDTH).map_err(|_| ())?;
    writer.write_all(&bytes).await.map_err(|_| ())?;
    writer.flush().await.map_err(|_| ())
}

/// Reply with a relay cell as hop `at` of the chain.
async fn send_relay_from(
    chain: &mut Chain,
    at: usize,
    circuit_id: u32,
    cell: &RelayCell,
    writer: &mut Writer,
) -> Result<(), ()> {
    let mut payload = cell.to_payload().map_err(|_| ())?;
    chain.hops[at].backward.set_digest(&mut payload);
    for hop in chain.hops[..=at].iter_mut().rev() {
        hop.backward.apply_keystream(&mut payload);
    }
    write_cell(writer, &Cell::new(circuit_id, CellCommand::Relay, payload)).await
}

async fn run_session(
    net: Arc<TestNet>,
    entry_fp: String,
    stream: DuplexStream,
    mut cmd_rx: mpsc::UnboundedReceiver<NetCommand>,
) {
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut chains: HashMap<u32, Chain> = HashMap::new();
    let mut frame = vec![0u8; WIDTH.cell_size()];
    let mut commands_open = true;

    loop {
        tokio::select! {
            read = reader.read_exact(&mut frame) => {
                if read.is_err() {
                    return;
                }
                if handle_frame(&net, &entry_fp, &frame, &mut chains, &mut writer)
                    .await
                    .is_err()
                {
                    return;
                }
            }
            command = cmd_rx.recv(), if commands_open => {
                match command {
                    Some(NetCommand::DestroyCircuits { reason }) => {
                        let ids: Vec<u32> = chains.keys().copied().collect();
                        for id in ids {
                            chains.remove(&id);
                            if write_cell(&mut writer, &Cell::destroy(id, reason)).await.is_err() {
                                return;
                            }
                        }
                    }
                    None => commands_open = false,
                }
            }
        }
    }
}

async fn handle_frame(
    net: &Arc<TestNet>,
    entry_fp: &str,
    frame: &[u8],
    chains: &mut HashMap<u32, Chain>,
    writer: &mut Writer,
) -> Result<(), ()> {
    let cell = Cell::from_bytes(frame, WIDTH).map_err(|_| ())?;
    match cell.command {
        CellCommand::CreateFast => {
            if cell.payload.len() < 20 {
                return Err(());
            }
            let mut x = [0u8; 20];
            x.copy_from_slice(&cell.payload[..20]);
            let mut y = [0u8; 20];
            OsRng.fill_bytes(&mut y);
            let (kh, km) = derive_fast(&x, &y);

            let mut chain = Chain::new();
            chain.push_hop(entry_fp.to_string(), &km);
            chains.insert(cell.circuit_id, chain);

            let mut reply = Vec::with_capacity(40);
            reply.extend_from_slice(&y);
            reply.extend_from_slice(&kh);
            write_cell(
                writer,
                &Cell::new(cell.circuit_id, CellCommand::CreatedFast, reply),
            )
            .await
        }
        CellCommand::Create2 => {
            if cell.payload.len() < 4 {
                return Err(());
            }
            let hlen = u16::from_be_bytes([cell.payload[2], cell.payload[3]]) as usize;
            if cell.payload.len() < 4 + hlen {
                return Err(());
            }
            let onionskin = &cell.payload[4..4 + hlen];
            let (identity, secret) = relay_keys(net, entry_fp)?;
            let (reply, km) = ntor_server_handshake(&identity, secret, onionskin).map_err(|_| ())?;

            let mut chain = Chain::new();
            chain.push_hop(entry_fp.to_string(), &km);
            chains.insert(cell.circuit_id, chain);

            let mut payload = Vec::with_capacity(2 + reply.len());
            payload.extend_from_slice(&(reply.len() as u16).to_be_bytes());
            payload.extend_from_slice(&reply);
            write_cell(
                writer,
                &Cell::new(cell.circuit_id, CellCommand::Created2, payload),
            )
            .await
        }
        CellCommand::Relay | CellCommand::RelayEarly => {
            let circuit_id = cell.circuit_id;
            let Some(chain) = chains.get_mut(&circuit_id) else {
                return Ok(());
            };
            let mut payload = cell.payload;
            let mut recognized = None;
            for (i, hop) in chain.hops.iter_mut().enumerate() {
                hop.forward.apply_keystream(&mut payload);
                if RelayCell::payload_recognized(&payload) && hop.forward.check_digest(&payload) {
                    recognized = Some(i);
                    break;
                }
            }
            let Some(at) = recognized else {
                return Ok(());
            };
            let relay_cell = RelayCell::from_payload(&payload).map_err(|_| ())?;
            handle_relay_cell(net, chain, circuit_id, at, relay_cell, writer).await
        }
        CellCommand::Destroy => {
            chains.remove(&cell.circuit_id);
            Ok(())
        }
        _ => Ok(()),
    }
}

async fn handle_relay_cell(
    net: &Arc<TestNet>,
    chain: &mut Chain,
    circuit_id: u32,
    at: usize,
    cell: RelayCell,
    writer: &mut Writer,
) -> Result<(), ()> {
    match cell.command {
        RelayCommand::Extend2 => {
            let (specs, onionskin) = parse_extend2(&cell.data).map_err(|_| ())?;
            let identity_spec = specs.iter().find(|(t, _)| *t == 2).ok_or(())?;
            let fp = hex::encode_upper(&identity_spec.1);
            let (identity, secret) = relay_keys(net, &fp)?;
            let (reply, km) =
                ntor_server_handshake(&identity, secret, &onionskin).map_err(|_| ())?;

            let mut data = Vec::with_capacity(2 + reply.len());
            data.extend_from_slice(&(reply.len() as u16).to_be_bytes());
            data.extend_from_slice(&reply);
            let extended = RelayCell::new(RelayCommand::Extended2, 0, data);
            send_relay_from(chain, at, circuit_id, &extended, writer).await?;
            // The new hop starts participating only after EXTENDED2.
            chain.push_hop(fp, &km);
            Ok(())
        }
        RelayCommand::Begin | RelayCommand::BeginDir => {
            if net.behavior.drop_connected.load(Ordering::SeqCst) {
                return Ok(());
            }
            let failing = net
                .behavior
                .failing_exits
                .lock()
                .unwrap()
                .contains(&chain.hops[at].fingerprint);
            let reply = if failing {
                RelayCell::new(RelayCommand::End, cell.stream_id, vec![4]) // EXITPOLICY
            } else {
                RelayCell::new(RelayCommand::Connected, cell.stream_id, Vec::new())
            };
            send_relay_from(chain, at, circuit_id, &reply, writer).await
        }
        RelayCommand::Data => {
            chain.circuit_deliver += 1;
            if chain.circuit_deliver % 100 == 0 {
                let sendme = RelayCell::new(RelayCommand::Sendme, 0, Vec::new());
                send_relay_from(chain, at, circuit_id, &sendme, writer).await?;
            }
            let delivered = chain.stream_deliver.entry(cell.stream_id).or_insert(0);
            *delivered += 1;
            if *delivered % 50 == 0 {
                let sendme = RelayCell::new(RelayCommand::Sendme, cell.stream_id, Vec::new());
                send_relay_from(chain, at, circuit_id, &sendme, writer).await?;
            }
            if net.behavior.echo_data.load(Ordering::SeqCst) {
                let echo = RelayCell::new(RelayCommand::Data, cell.stream_id, cell.data);
                send_relay_from(chain, at, circuit_id, &echo, writer).await?;
            }
            Ok(())
        }
        RelayCommand::End => {
            chain.stream_deliver.remove(&cell.stream_id);
            Ok(())
        }
        RelayCommand::Sendme => Ok(()),
        _ => Ok(()),
    }
}

fn relay_keys(net: &Arc<TestNet>, fingerprint: &str) -> Result<([u8; 20], [u8; 32]), ()> {
    let secret = *net.onion_secrets.get(fingerprint).ok_or(())?;
    let bytes = hex::decode(fingerprint).map_err(|_| ())?;
    let mut identity = [0u8; 20];
    identity.copy_from_slice(&bytes);
    Ok((identity, secret))
}
