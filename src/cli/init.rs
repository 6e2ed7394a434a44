use super::CliContext;
use rackctl::app::cmd_init;

pub async fn execute(context: &CliContext) -> anyhow::Result<()> {
    cmd_init(&context.root).await?;
    println!(
        "rackctl has been initialised at {}. You can start it with 'rackctl run'",
        context.root.display()
    );
    Ok(())
}
