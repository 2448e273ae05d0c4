use chrono::Local;
use clap::Parser;
use log::{error, info, warn};
use wa_session_keeper::bot::Bot;
use wa_session_keeper::config::BotConfig;
use wa_session_keeper::health;
use wa_session_keeper::session::SessionExit;

// Keeps a chat session alive and logs every message it receives.
//
// Usage:
//   wa-session-keeper                                  # QR code pairing only
//   wa-session-keeper --phone 15551234567              # Pair code + QR code
//   wa-session-keeper -p 15551234567 -c KPR4TX9Z       # Custom 8-char pair code
//   wa-session-keeper --private --on-logout halt

fn main() {
    let config = BotConfig::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "{} [{:<5}] [{}] - {}",
                Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to build tokio runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = rt.block_on(run(config)) {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(config: BotConfig) -> anyhow::Result<()> {
    if let Some(phone) = &config.phone_number {
        info!("Phone number provided: {}", phone);
        info!("Will use pair code authentication (concurrent with QR)");
    }
    let port = config.port;

    let bot = Bot::builder().with_config(config).build().await?;

    let health_state = bot.health_state();
    tokio::spawn(async move {
        if let Err(e) = health::serve(port, health_state).await {
            error!(target: "Health", "Health server stopped: {}", e);
        }
    });

    let mut session = bot.run().await?;

    tokio::select! {
        result = &mut session => {
            match result {
                Ok(Ok(SessionExit::Halted(reason))) => {
                    warn!("Session halted ({:?}). Restart to link the device again.", reason);
                }
                Ok(Ok(SessionExit::Shutdown)) => {}
                Ok(Err(e)) => error!("Session loop failed: {}", e),
                Err(e) => error!("Session task panicked: {}", e),
            }
            bot.cache().flush().await?;
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!("Failed to listen for Ctrl-C: {}", e);
            }
            bot.shutdown().await?;
            if let Err(e) = session.await {
                warn!("Session task ended abnormally: {}", e);
            }
        }
    }

    info!("Bye");
    Ok(())
}
