use anyhow::Result;
use fact_checker_host_lib::session::config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    fact_checker_host_lib::init_logging();

    let config = Config::from_env();
    fact_checker_host_lib::run(config).await
}
