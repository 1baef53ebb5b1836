use crate::config::Settings;
use crate::launcher::{self, Live};
use anyhow::Result;
use rustyline::DefaultEditor;
use tokio::sync::mpsc;

/// Read lines on a blocking thread; `None` marks the end of input.
fn spawn_reader() -> mpsc::UnboundedReceiver<Option<String>> {
    let (tx, rx) = mpsc::unbounded_channel();
    std::thread::spawn(move || {
        let mut rl = match DefaultEditor::new() {
            Ok(rl) => rl,
            Err(e) => {
                eprintln!("Error: {e}");
                let _ = tx.send(None);
                return;
            }
        };
        loop {
            match rl.readline("you   > ") {
                Ok(line) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let _ = rl.add_history_entry(&line);
                    if tx.send(Some(line)).is_err() {
                        break;
                    }
                }
                Err(rustyline::error::ReadlineError::Interrupted | rustyline::error::ReadlineError::Eof) => {
                    let _ = tx.send(None);
                    break;
                }
                Err(err) => {
                    eprintln!("Error: {err}");
                    let _ = tx.send(None);
                    break;
                }
            }
        }
    });
    rx
}

pub async fn run_console(settings: Settings) -> Result<()> {
    let Live { client, mut events } = launcher::build(&settings, false)?;
    client.connect().await?;

    println!("Vox chat, model {}", settings.model);
    println!("Type a message and press Enter. Ctrl+C or Ctrl+D to exit.\n");

    let mut lines = spawn_reader();
    let reason = loop {
        tokio::select! {
            line = lines.recv() => match line.flatten() {
                Some(line) => {
                    if let Err(e) = client.send_text(line).await {
                        eprintln!("Error: {e}");
                    }
                }
                None => break None,
            },
            reason = launcher::render_events(&mut events) => break reason,
        }
    };

    client.disconnect().await;
    launcher::check_close(reason)
}
