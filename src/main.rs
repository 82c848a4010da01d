use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Arg, ArgAction, ArgMatches, Command};
use log::{error, info, warn};
use tokio::net::TcpListener;

use parley::{
    AppConfig, AudioCodec, AudioSink, AudioSource, CallController, CallOutcome, CallSession,
    CallState, ConfigManager, CpalSink, CpalSource, IdentityKey, MediaDevices, NullSink, OpusCodec,
    PcmCodec, RendezvousServer, SignalingChannel, ToneSource, UdpMediaEngine, WavFileSink,
    WavFileSource, rendezvous,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    env_logger::init();

    let matches = cli().get_matches();

    let mut config_manager = match matches.get_one::<PathBuf>("config") {
        Some(path) => ConfigManager::with_path(path)?,
        None => ConfigManager::new().unwrap_or_else(|e| {
            error!("Failed to initialize configuration manager: {:#}", e);
            error!("Falling back to default configuration");
            ConfigManager::with_config(AppConfig::default())
        }),
    };

    match matches.subcommand() {
        Some(("serve", sub)) => {
            let bind = *sub.get_one::<SocketAddr>("bind")
                .context("missing bind address")?;
            serve(bind).await
        }
        Some(("identity", _)) => {
            let identity = config_manager.ensure_identity()?;
            println!("Identity: {}", identity.public_base64());
            println!("Fingerprint: {}", parley::crypto::fingerprint(&identity.verifying_key()));
            println!("Config: {:?}", config_manager.config_path());
            Ok(())
        }
        Some((mode, sub)) => {
            let config = effective_config(config_manager.get_config(), sub)?;
            let identity = config_manager.ensure_identity()?;
            let options = CallOptions::from_matches(sub);

            let (channel, peer_id, dial) = match mode {
                "listen" => {
                    let port = sub.get_one::<u16>("port").copied()
                        .unwrap_or(config.network.listen_port);
                    (accept_one(port).await?, None, false)
                }
                "call" => {
                    let addr = sub.get_one::<String>("addr").context("missing address")?;
                    let channel = SignalingChannel::connect(addr.as_str()).await
                        .with_context(|| format!("Failed to connect to {}", addr))?;
                    (channel, None, true)
                }
                "dial" | "wait" => {
                    let via = sub.get_one::<String>("via").cloned()
                        .unwrap_or_else(|| config.network.rendezvous_addr.clone());
                    let channel = SignalingChannel::connect(via.as_str()).await
                        .with_context(|| format!("Failed to reach rendezvous server {}", via))?;
                    rendezvous::register(&channel, &config.identity.local_id, config.identity.display_name.clone())?;
                    println!("Registered as '{}' on {}", config.identity.local_id, via);
                    let peer = sub.get_one::<String>("peer").cloned();
                    let dial = mode == "dial";
                    (channel, peer, dial)
                }
                other => bail!("unknown command {}", other),
            };

            let outcome = run_call(&config, identity, channel, peer_id, dial, options).await?;
            match outcome {
                CallOutcome::Completed { reason } => {
                    println!("Call ended: {}", reason);
                    Ok(())
                }
                CallOutcome::Failed(e) => bail!("call failed: {}", e),
            }
        }
        None => {
            cli().print_help()?;
            Ok(())
        }
    }
}

fn cli() -> Command {
    let allow = Arg::new("allow")
        .long("allow")
        .value_name("ID")
        .action(ArgAction::Append)
        .help("Only answer this caller (repeatable; overrides config)");
    let call_args = [
        Arg::new("input")
            .long("input")
            .value_name("WAV")
            .help("16-bit PCM WAV file to send (default: microphone)")
            .value_parser(clap::value_parser!(PathBuf)),
        Arg::new("output")
            .long("output")
            .value_name("WAV")
            .help("Record received audio to this WAV file (default: speaker)")
            .value_parser(clap::value_parser!(PathBuf)),
        Arg::new("tone")
            .long("tone")
            .action(ArgAction::SetTrue)
            .help("Send a test tone instead of the microphone"),
        Arg::new("codec")
            .long("codec")
            .value_name("CODEC")
            .help("Audio codec; both sides must agree")
            .value_parser(["pcm", "opus"]),
        Arg::new("duration")
            .long("duration")
            .value_name("SECONDS")
            .help("Hang up automatically after this many seconds")
            .value_parser(clap::value_parser!(u64)),
        Arg::new("id")
            .long("id")
            .value_name("NAME")
            .help("Local identifier (overrides config)"),
        Arg::new("psk")
            .long("psk")
            .value_name("PASSPHRASE")
            .help("Pre-shared passphrase mixed into the call keys"),
    ];

    Command::new("parley")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Encrypted peer-to-peer voice calls")
        .subcommand_required(false)
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("PATH")
                .help("Configuration file (default: platform config dir)")
                .value_parser(clap::value_parser!(PathBuf))
                .global(true)
        )
        .subcommand(
            Command::new("serve")
                .about("Run a rendezvous server")
                .arg(
                    Arg::new("bind")
                        .long("bind")
                        .value_name("ADDR")
                        .value_parser(clap::value_parser!(SocketAddr))
                        .default_value("0.0.0.0:7879")
                )
        )
        .subcommand(Command::new("identity").about("Show (and create) the local identity key"))
        .subcommand(
            Command::new("listen")
                .about("Wait for one direct incoming call")
                .arg(
                    Arg::new("port")
                        .long("port")
                        .value_name("PORT")
                        .value_parser(clap::value_parser!(u16))
                )
                .arg(allow.clone())
                .args(call_args.clone())
        )
        .subcommand(
            Command::new("call")
                .about("Call a listening peer directly")
                .arg(Arg::new("addr").value_name("HOST:PORT").required(true))
                .args(call_args.clone())
        )
        .subcommand(
            Command::new("dial")
                .about("Call a peer registered on a rendezvous server")
                .arg(Arg::new("peer").value_name("ID").required(true))
                .arg(Arg::new("via").long("via").value_name("HOST:PORT"))
                .args(call_args.clone())
        )
        .subcommand(
            Command::new("wait")
                .about("Register on a rendezvous server and wait for a call")
                .arg(Arg::new("via").long("via").value_name("HOST:PORT"))
                .arg(allow)
                .args(call_args)
        )
}

struct CallOptions {
    input: Option<PathBuf>,
    tone: bool,
    output: Option<PathBuf>,
    duration: Option<Duration>,
}

impl CallOptions {
    fn from_matches(matches: &ArgMatches) -> Self {
        Self {
            input: matches.get_one::<PathBuf>("input").cloned(),
            tone: matches.get_flag("tone"),
            output: matches.get_one::<PathBuf>("output").cloned(),
            duration: matches.get_one::<u64>("duration").map(|s| Duration::from_secs(*s)),
        }
    }
}

/// Stored configuration with command line overrides applied
fn effective_config(stored: &AppConfig, matches: &ArgMatches) -> Result<AppConfig> {
    let mut config = stored.clone();
    if let Some(codec) = matches.get_one::<String>("codec") {
        config.audio.codec = codec.clone();
    }
    if let Some(id) = matches.get_one::<String>("id") {
        config.identity.local_id = id.clone();
    }
    if let Some(psk) = matches.get_one::<String>("psk") {
        config.security.pre_shared_secret = Some(psk.clone());
    }
    if let Ok(Some(allowed)) = matches.try_get_many::<String>("allow") {
        config.security.allowed_callers = allowed.cloned().collect();
    }
    config.validate()?;
    Ok(config)
}

async fn serve(bind: SocketAddr) -> Result<()> {
    let server = RendezvousServer::bind(bind).await?;
    println!("Rendezvous server listening on {}", server.local_addr()?);
    println!("Press Ctrl+C to stop...");

    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            println!("\nStopping rendezvous server");
            Ok(())
        }
    }
}

async fn accept_one(port: u16) -> Result<SignalingChannel> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await
        .with_context(|| format!("Failed to listen on port {}", port))?;
    println!("Waiting for a call on port {}...", port);
    let (stream, peer) = listener.accept().await.context("Failed to accept call")?;
    info!("Incoming call from {}", peer);
    Ok(SignalingChannel::from_tcp(stream))
}

fn make_codec(config: &AppConfig) -> Result<Box<dyn AudioCodec>> {
    Ok(match config.audio.codec.as_str() {
        "opus" => Box::new(OpusCodec::new(config.to_opus_config())?),
        _ => Box::new(PcmCodec::new(config.to_audio_format())),
    })
}

fn make_devices(config: &AppConfig, options: &CallOptions) -> Result<MediaDevices> {
    let format = config.to_audio_format();
    let source: Box<dyn AudioSource> = match options.input {
        Some(ref path) => Box::new(WavFileSource::open(path, format)?),
        None if options.tone => Box::new(ToneSource::new(format, 440.0)),
        None => match CpalSource::open(format) {
            Ok(microphone) => Box::new(microphone),
            Err(e) => {
                warn!("Microphone unavailable ({:#}), sending a test tone", e);
                Box::new(ToneSource::new(format, 440.0))
            }
        },
    };
    let sink: Box<dyn AudioSink> = match options.output {
        Some(ref path) => Box::new(WavFileSink::create(path, format)?),
        None => match CpalSink::open(format) {
            Ok(speaker) => Box::new(speaker),
            Err(e) => {
                warn!("Speaker unavailable ({:#}), discarding received audio", e);
                Box::new(NullSink::default())
            }
        },
    };

    Ok(MediaDevices {
        source,
        sink,
        encoder: make_codec(config)?,
        decoder: make_codec(config)?,
    })
}

async fn run_call(
    config: &AppConfig,
    identity: IdentityKey,
    channel: SignalingChannel,
    peer_id: Option<String>,
    dial: bool,
    options: CallOptions,
) -> Result<CallOutcome> {
    let devices = make_devices(config, &options)?;
    let engine = UdpMediaEngine::new(config.to_audio_format(), config.to_jitter_config(), devices);
    let session = CallSession::new(config.to_session_config(peer_id)?, identity)
        .with_incoming_policy(config.to_incoming_policy());
    let controller = CallController::new(session, channel, Box::new(engine), config.to_controller_settings()?);

    let mut handle = if dial {
        println!("Calling...");
        controller.spawn_dial()
    } else {
        controller.spawn_answer()
    };

    let active = tokio::select! {
        state = handle.wait_for(CallState::Active) => state == CallState::Active,
        _ = tokio::signal::ctrl_c() => {
            handle.hangup("user hung up");
            false
        }
    };

    if active {
        let status = handle.status();
        println!("Connected. Peer fingerprint: {}",
                 status.peer_fingerprint.as_deref().unwrap_or("unknown"));
        println!("Press Ctrl+C to hang up...");

        let duration = options.duration;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => handle.hangup("user hung up"),
            _ = tokio::time::sleep(duration.unwrap_or_default()), if duration.is_some() => {
                handle.hangup("duration elapsed")
            }
            _ = handle.wait_for(CallState::Closed) => {}
        }
    }

    Ok(handle.join().await)
}
