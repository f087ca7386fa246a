use color_eyre::Result;
use color_eyre::eyre::{eyre, OptionExt};
use vesta::app::App;
use vesta::app::headless;

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        Some("--headless") => {
            let frames = args
                .next()
                .ok_or_eyre("--headless expects a frame count")?
                .parse::<u32>()?;
            headless::run(frames)?;
        }
        Some(other) => return Err(eyre!("Unknown argument: {}", other)),
        None => {
            let app = App::new()?;
            app.run()?;
        }
    }

    Ok(())
}
