// Copyright (c) Facebook, Inc. and its affiliates.
use log::{error, info};
use std::process::exit;

use cpm_util::*;
use cpu_power_model_intf::{Args, FULL_VERSION};

mod features;
mod graph;
mod influx;
mod model;
mod outliers;
mod report;
mod run;
mod series;
mod test_mode;
mod timestamps;

use influx::InfluxClient;
use run::RunCtx;

fn main() {
    let (args_file, updated) = Args::init_args_and_logging_nosave().unwrap_or_else(|e| {
        error!("Failed to process args file ({:#})", &e);
        exit(1);
    });

    if updated {
        if let Err(e) = Args::save_args(&args_file) {
            error!("Failed to update args file ({:#})", &e);
            exit(1);
        }
    }

    let args = &args_file.data;
    info!("cpu-power-model {}", &*FULL_VERSION);
    for line in args.format_config().lines() {
        info!("cfg: {}", line);
    }

    if let Err(e) = args.check() {
        error!("Invalid configuration ({:#})", &e);
        exit(1);
    }

    let client = match InfluxClient::new(args) {
        Ok(v) => v,
        Err(e) => {
            error!("Failed to set up InfluxDB client ({:#})", &e);
            exit(1);
        }
    };

    let mut rctx = RunCtx::new(args, &client);
    if let Err(e) = rctx.run() {
        error!("{:#}", &e);
        exit(1);
    }
}
