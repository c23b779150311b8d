//! Full-screen chat
//!
//! Ratatui interface: a mood panel on the left, the conversation on the
//! right. Each turn runs on its own tokio task and reports back over a
//! channel, so the screen keeps redrawing while the model thinks.

use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    backend::CrosstermBackend,
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph, Wrap},
    Frame, Terminal,
};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

use companion_core::{ConversationSession, SessionEvent};

use crate::memory;

const FACE_LISTENING: &str = "\
\n\
.-----.\n\
| o o |\n\
|  ‿  |\n\
'-----'\n\
\n\
LISTENING";

const FACE_THINKING: &str = "\
\n\
.-----.\n\
| - - |\n\
|  ~  |\n\
'-----'\n\
\n\
THINKING...";

const FACE_REPLIED: &str = "\
\n\
.-----.\n\
| ^ ^ |\n\
|  ◡  |\n\
'-----'\n\
\n\
REPLIED";

#[derive(Debug, Clone, Copy, PartialEq)]
enum Mood {
    Listening,
    Thinking,
    Replied,
}

#[derive(Clone, Copy, PartialEq)]
enum Speaker {
    You,
    Companion,
    Notice,
}

struct ChatLine {
    speaker: Speaker,
    content: String,
}

/// Messages from a turn task back to the UI
enum UiEvent {
    Session(SessionEvent),
    Reply(String),
}

struct App {
    lines: Vec<ChatLine>,
    input: String,
    scroll: u16,
    mood: Mood,
    recalled: Vec<String>,
    model: String,
    session: Arc<Mutex<ConversationSession>>,
    tx: mpsc::UnboundedSender<UiEvent>,
    rx: mpsc::UnboundedReceiver<UiEvent>,
}

impl App {
    fn new(session: ConversationSession, model: String) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            lines: vec![],
            input: String::new(),
            scroll: 0,
            mood: Mood::Listening,
            recalled: vec![],
            model,
            session: Arc::new(Mutex::new(session)),
            tx,
            rx,
        }
    }

    fn is_busy(&self) -> bool {
        self.mood == Mood::Thinking
    }

    fn send_message(&mut self) {
        let text = self.input.trim().to_string();
        if text.is_empty() {
            return;
        }
        self.input.clear();
        self.lines.push(ChatLine {
            speaker: Speaker::You,
            content: text.clone(),
        });
        self.mood = Mood::Thinking;

        let session = self.session.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let mut session = session.lock().await;
            let events = tx.clone();
            let reply = session
                .process_message(&text, move |event| {
                    let _ = events.send(UiEvent::Session(event));
                })
                .await;
            let _ = tx.send(UiEvent::Reply(reply));
        });
    }

    fn drain_events(&mut self) {
        while let Ok(event) = self.rx.try_recv() {
            match event {
                UiEvent::Session(SessionEvent::ContextRefreshed { keywords }) => {
                    self.recalled = keywords;
                }
                UiEvent::Session(SessionEvent::Error(err)) => self.lines.push(ChatLine {
                    speaker: Speaker::Notice,
                    content: format!("⚠ {}", err),
                }),
                UiEvent::Session(_) => {}
                UiEvent::Reply(reply) => {
                    self.lines.push(ChatLine {
                        speaker: Speaker::Companion,
                        content: reply,
                    });
                    self.mood = Mood::Replied;
                }
            }
        }
    }
}

pub async fn run_tui(session: ConversationSession, model: String) -> anyhow::Result<()> {
    let mut app = App::new(session, model);

    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = run_event_loop(&mut terminal, &mut app).await;

    let backend = terminal.backend_mut();
    let mut raw = || disable_raw_mode();
    let mut screen = || execute!(backend, LeaveAlternateScreen);
    let steps: [&mut dyn FnMut() -> io::Result<()>; 2] = [&mut raw, &mut screen];
    let restored = restore_terminal(steps);
    result?;
    restored?;

    // Waits for an in-flight turn to finish
    let mut session = app.session.lock().await;
    memory::save_session(&mut session).await?;
    Ok(())
}

/// Runs every step even after a failure, returning the first error
fn restore_terminal<const N: usize>(
    steps: [&mut dyn FnMut() -> io::Result<()>; N],
) -> io::Result<()> {
    let mut first = Ok(());
    for step in steps {
        let outcome = step();
        if first.is_ok() {
            first = outcome;
        }
    }
    first
}

async fn run_event_loop(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    app: &mut App,
) -> anyhow::Result<()> {
    loop {
        app.drain_events();
        terminal.draw(|f| draw_ui(f, app))?;

        if !event::poll(Duration::from_millis(50))? {
            tokio::task::yield_now().await;
            continue;
        }
        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }
        match key.code {
            KeyCode::Esc => break,
            KeyCode::Up => app.scroll = app.scroll.saturating_sub(1),
            KeyCode::Down => app.scroll = app.scroll.saturating_add(1),
            _ if app.is_busy() => {}
            KeyCode::Enter => app.send_message(),
            KeyCode::Char(c) => {
                app.mood = Mood::Listening;
                app.input.push(c);
            }
            KeyCode::Backspace => {
                app.input.pop();
            }
            _ => {}
        }
    }
    Ok(())
}

fn draw_ui(f: &mut Frame, app: &App) {
    let main_chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Length(20), // mood panel
            Constraint::Min(40),    // chat area
        ])
        .split(f.size());

    draw_mood(f, app, main_chunks[0]);
    draw_chat(f, app, main_chunks[1]);
}

fn draw_mood(f: &mut Frame, app: &App, area: Rect) {
    let (face, color) = match app.mood {
        Mood::Listening => (FACE_LISTENING, Color::Cyan),
        Mood::Thinking => (FACE_THINKING, Color::Yellow),
        Mood::Replied => (FACE_REPLIED, Color::Green),
    };

    let widget = Paragraph::new(face)
        .style(Style::default().fg(color))
        .alignment(Alignment::Center)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::DarkGray))
                .title(Span::styled(" Companion ", Style::default().fg(color))),
        );
    f.render_widget(widget, area);
}

fn draw_chat(f: &mut Frame, app: &App, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Min(10),   // messages
            Constraint::Length(3), // input
            Constraint::Length(1), // status bar
        ])
        .split(area);

    let mut chat_lines: Vec<Line> = vec![];
    for line in &app.lines {
        let (color, label) = match line.speaker {
            Speaker::You => (Color::Green, "You"),
            Speaker::Companion => (Color::Cyan, "Companion"),
            Speaker::Notice => (Color::Red, "Notice"),
        };
        chat_lines.push(Line::from(Span::styled(
            label,
            Style::default().fg(color).add_modifier(Modifier::BOLD),
        )));
        let text_color = if line.speaker == Speaker::You {
            Color::White
        } else {
            Color::Gray
        };
        for text in line.content.lines() {
            chat_lines.push(Line::from(Span::styled(
                format!("  {}", text),
                Style::default().fg(text_color),
            )));
        }
        chat_lines.push(Line::from(""));
    }

    let chat = Paragraph::new(chat_lines)
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::DarkGray))
                .title(Span::styled(" Conversation ", Style::default().fg(Color::Cyan))),
        )
        .wrap(Wrap { trim: false })
        .scroll((app.scroll, 0));
    f.render_widget(chat, chunks[0]);

    let (input_border, input_title) = if app.is_busy() {
        (Color::DarkGray, " Wait... ")
    } else {
        (Color::Cyan, " Message ")
    };
    let input = Paragraph::new(app.input.as_str())
        .style(Style::default().fg(Color::White))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(input_border))
                .title(Span::styled(input_title, Style::default().fg(input_border))),
        );
    f.render_widget(input, chunks[1]);

    let recalled = if app.recalled.is_empty() {
        String::new()
    } else {
        format!(" recalled: {} ", app.recalled.join(", "))
    };
    let status = Paragraph::new(Line::from(vec![
        Span::styled(" ESC", Style::default().fg(Color::Yellow)),
        Span::styled(" quit ", Style::default().fg(Color::DarkGray)),
        Span::styled("ENTER", Style::default().fg(Color::Yellow)),
        Span::styled(" send ", Style::default().fg(Color::DarkGray)),
        Span::styled("↑↓", Style::default().fg(Color::Yellow)),
        Span::styled(" scroll ", Style::default().fg(Color::DarkGray)),
        Span::styled("|", Style::default().fg(Color::DarkGray)),
        Span::styled(recalled, Style::default().fg(Color::Blue)),
        Span::styled("| ", Style::default().fg(Color::DarkGray)),
        Span::styled(app.model.as_str(), Style::default().fg(Color::Magenta)),
    ]));
    f.render_widget(status, chunks[2]);
}
