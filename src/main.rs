use clap::Parser;
use keypipe::Config;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::parse();
    log::debug!("{config:?}");

    let code = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        // Everything owned by the session, the terminal guard included, is dropped
        // before exiting.
        Ok(rt) => rt.block_on(keypipe::run(&config)),
        Err(e) => {
            log::error!("failed to start runtime: {e}");
            keypipe::capture::EXIT_FAILURE
        }
    };

    std::process::exit(code);
}
