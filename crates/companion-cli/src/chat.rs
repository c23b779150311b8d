//! Line-oriented chat on stdin/stdout

use companion_core::{ConversationSession, SessionEvent};
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::memory;

pub async fn run(mut session: ConversationSession) -> anyhow::Result<()> {
    println!("Companion is listening. /context shows what I remember, /quit ends the chat.\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("you> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            println!();
            break;
        };
        let text = line.trim();
        match text {
            "" => continue,
            "/quit" | "/exit" => break,
            "/context" => {
                println!("{}", memory::render_context(session.context()));
                continue;
            }
            _ => {}
        }

        let reply = session
            .process_message(text, |event| {
                if let SessionEvent::Error(err) = event {
                    eprintln!("(error: {})", err);
                }
            })
            .await;
        println!("companion> {}\n", reply);
    }

    memory::save_session(&mut session).await
}
