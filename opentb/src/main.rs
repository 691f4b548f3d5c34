/**
 * OPENTB CLI - Point d'entrée de l'outil de commande OpenTestbed
 *
 * RÔLE : Parse la ligne de commande, charge la config, valide les entrées
 * puis envoie une commande MQTT aux boxes ou aux motes du testbed.
 *
 * Les timeouts par device sont reportés, pas des erreurs : seul un input
 * invalide ou un broker injoignable donne un code de sortie non nul.
 */

use anyhow::{Context, Result};
use clap::Parser;
use opentb::app;
use opentb::cli::Cli;
use opentb::config::TestbedConfig;
use opentb::logging;
use tracing::debug;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.loglevel);

    let mut config = TestbedConfig::load().await;
    cli.apply_to(&mut config);
    debug!("Broker {}:{}", config.mqtt.host, config.mqtt.port);

    let command = cli.command;
    let request = cli.into_request();
    let summary = app::run(&request, &config)
        .await
        .with_context(|| format!("{} failed", command))?;

    debug!("{} of {} recipients answered", summary.answered(), summary.total());
    Ok(())
}
