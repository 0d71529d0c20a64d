use std::sync::Arc;

use astra_live::{
    load_settings, LiveBackend, SessionController, SessionOptions, Speaker, Status, UiSnapshot,
};

#[tokio::main]
async fn main() {
    // Load .env file if present (for development convenience)
    // Silently ignore if not found - production uses system env vars
    let _ = dotenvy::dotenv();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings = load_settings();
    log::info!("Using model {}", settings.model);

    let backend = Arc::new(LiveBackend::from_env(settings.clone()));
    let controller = SessionController::spawn(backend, SessionOptions::from(&settings));
    let mut updates = controller.subscribe();

    controller.start();
    println!("Talk to Astra. Press Ctrl-C to end the conversation.");

    let mut last_status = Status::Idle;
    let mut printed = 0;
    let mut stopping = false;

    loop {
        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = updates.borrow_and_update().clone();
                printed = print_new_turns(&snapshot, printed);

                if snapshot.status != last_status {
                    println!("[{}]", snapshot.status);
                }
                if snapshot.status == Status::Error {
                    if let Some(err) = &snapshot.last_error {
                        eprintln!("Error: {}", err);
                    }
                    break;
                }
                if snapshot.status == Status::Idle && last_status != Status::Idle {
                    break;
                }
                last_status = snapshot.status;
            }
            result = tokio::signal::ctrl_c(), if !stopping => {
                if let Err(e) = result {
                    log::warn!("Failed to listen for Ctrl-C: {}", e);
                }
                stopping = true;
                controller.stop();
            }
        }
    }

    controller.shutdown().await;
}

fn print_new_turns(snapshot: &UiSnapshot, printed: usize) -> usize {
    for entry in snapshot.transcript.iter().skip(printed) {
        let who = match entry.speaker {
            Speaker::User => "You",
            Speaker::Agent => "Astra",
        };
        println!("{}: {}", who, entry.text);
    }
    snapshot.transcript.len()
}
