// SPDX-License-Identifier: Apache-2.0

use std::process::ExitCode;

use querygate_lib::config::GatewayConfig;
use querygate_lib::observability;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match GatewayConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("querygate: {}", e);
            return ExitCode::FAILURE;
        }
    };

    observability::init_tracing(&config.log_dir);

    match querygate_lib::run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("querygate: {}", e);
            ExitCode::FAILURE
        }
    }
}
