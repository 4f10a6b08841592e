//! Logging facilities

use log::LevelFilter;
use log4rs::{
    append::console::{ConsoleAppender, Target},
    config::{Appender, Config, Logger, Root},
    encode::pattern::PatternEncoder,
};

pub fn init(bin_name: &str, debug_level: u8, without_time: bool) {
    let mut pattern = String::new();
    if !without_time {
        pattern += "{d} ";
    }
    pattern += "{h({l}):<5} ";
    if debug_level >= 1 {
        pattern += "[{M}] ";
    }
    pattern += "{m}{n}";

    let logging_builder = Config::builder().appender(
        Appender::builder().build(
            "console",
            Box::new(
                ConsoleAppender::builder()
                    .encoder(Box::new(PatternEncoder::new(&pattern)))
                    .target(Target::Stderr)
                    .build(),
            ),
        ),
    );

    let crate_level = match debug_level {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    let config = if debug_level >= 3 {
        logging_builder.build(Root::builder().appender("console").build(LevelFilter::Trace))
    } else {
        logging_builder
            .logger(Logger::builder().build(bin_name, crate_level))
            .logger(Logger::builder().build("fronthaul", crate_level))
            .logger(Logger::builder().build("fronthaul_service", crate_level))
            .build(Root::builder().appender("console").build(LevelFilter::Off))
    }
    .expect("logging");

    log4rs::init_config(config).expect("logging");
}
