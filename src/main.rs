use clap::Parser;
use tracing::{error, info};

use wip::cli::{Cli, Commands};
use wip::config::ConfigFile;
use wip::servers::Fleet;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    wip::logging::init_subscriber();

    let cli = Cli::parse();

    if let Commands::GenPassphrase { role, length } = cli.command {
        return match wip::cli::gen_passphrase(role, length) {
            Some(passphrase) => {
                println!("{passphrase}");
                Ok(())
            }
            None => Ok(()),
        };
    }

    let config_path = cli.config();
    let config = match ConfigFile::try_as_cowcell(config_path.as_ref()) {
        Ok(config) => config,
        Err(err) => {
            error!(%err, "failed to load configuration");
            return Err(err);
        }
    };

    match cli.command {
        Commands::ConfigCheck { .. } => {
            let snapshot = config.read().await;
            wip::cli::report_config_check(&snapshot);
            Ok(())
        }
        Commands::ExportConfig { .. } => {
            let snapshot = config.read().await;
            wip::cli::export_config(&snapshot);
            Ok(())
        }
        Commands::Serve { role, .. } => {
            let roles = role.roles();
            info!(?roles, "starting fleet");
            let cache_snapshot_path = config.read().await.cache_snapshot_path.clone();
            let mut fleet = Fleet::spawn(&config, &roles, cache_snapshot_path).await;

            // Mirrors goatns's own shutdown posture (its `Servers` bundle
            // of JoinHandles, waited on until one returns): once any role
            // task exits we tear the rest down rather than limp along
            // partially serving traffic.
            let result = wait_for_any_exit(&mut fleet).await;
            fleet.cache_join.abort();
            result
        }
        Commands::GenPassphrase { .. } => unreachable!("handled above"),
    }
}

async fn wait_for_any_exit(fleet: &mut Fleet) -> std::io::Result<()> {
    loop {
        let finished = fleet
            .role_joins
            .iter()
            .find(|(_, join)| join.is_finished())
            .map(|(role, _)| *role);

        if let Some(role) = finished {
            let join = fleet
                .role_joins
                .remove(&role)
                .expect("role was just observed present");
            return match join.await {
                Ok(Ok(())) => {
                    info!(%role, "role task exited cleanly");
                    Ok(())
                }
                Ok(Err(err)) => {
                    error!(%role, %err, "role task exited with an error");
                    Err(err)
                }
                Err(join_err) => {
                    error!(%role, %join_err, "role task panicked");
                    Err(std::io::Error::other(join_err.to_string()))
                }
            };
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
}
