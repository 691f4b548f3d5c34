/**
 * OPENTB LOGGER - Enregistre les données MQTT du testbed dans un fichier
 *
 * RÔLE : S'abonne au topic de données (uinject par défaut) et écrit chaque
 * message en JSON lines jusqu'à la fin du runtime ou Ctrl-C.
 */

use anyhow::Result;
use clap::Parser;
use opentb::data_logger::{self, LoggerArgs};
use opentb::logging;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Ok si .env n'existe pas

    let args = LoggerArgs::parse();
    logging::init(args.loglevel);

    data_logger::run(&args).await
}
