use std::collections::VecDeque;
use std::error::Error;
use std::io::stdout;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use crossbeam_channel::unbounded;
use crossterm::ExecutableCommand;
use crossterm::event::{self, Event as CEvent, KeyCode, KeyEvent};
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Cell, Paragraph, Row, Table, Wrap};

use crate::control::api;
use crate::engine::EngineState;
use crate::error::AudioError;
use crate::position::Position;
use crate::stream::{StreamDirection, StreamInfo};
use crate::{EngineSnapshot, pop_log};

const TICK_RATE: Duration = Duration::from_millis(100);
const LOG_LINES: usize = 6;

#[derive(Default)]
struct AppState {
    status: Option<EngineSnapshot>,
    selected: usize,
    message: Option<String>,
    last_update: Option<Instant>,
    log: VecDeque<String>,
}

/// Run the ratatui-based developer console.
pub fn run() -> Result<(), Box<dyn Error>> {
    setup_terminal()?;

    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;
    terminal.clear()?;

    let (status_tx, status_rx) = unbounded();
    std::thread::spawn(move || {
        loop {
            let status = api::get_status();
            if status_tx.send(status).is_err() {
                break;
            }
            std::thread::sleep(TICK_RATE);
        }
    });

    let mut app = AppState::default();

    loop {
        terminal.draw(|frame| draw(frame, &app))?;

        if let Some(status) = try_recv_latest(&status_rx) {
            app.status = status;
            app.last_update = Some(Instant::now());
            let stream_len = app.status.as_ref().map(|s| s.streams.len()).unwrap_or(0);
            if stream_len > 0 {
                app.selected = app.selected.min(stream_len - 1);
            } else {
                app.selected = 0;
            }
        }
        while let Some(line) = pop_log() {
            app.log.push_back(line);
            while app.log.len() > LOG_LINES {
                app.log.pop_front();
            }
        }

        if event::poll(Duration::from_millis(10))? {
            if let CEvent::Key(key) = event::read()? {
                if handle_key(&mut app, key) {
                    break;
                }
            }
        }
    }

    if api::tone_running() {
        let _ = api::toggle_tone();
    }
    restore_terminal()?;
    Ok(())
}

fn setup_terminal() -> Result<(), Box<dyn Error>> {
    enable_raw_mode()?;
    stdout().execute(EnterAlternateScreen)?;
    Ok(())
}

fn restore_terminal() -> Result<(), Box<dyn Error>> {
    disable_raw_mode()?;
    stdout().execute(LeaveAlternateScreen)?;
    Ok(())
}

fn try_recv_latest<T>(rx: &Receiver<T>) -> Option<T> {
    let mut last = None;
    while let Ok(value) = rx.try_recv() {
        last = Some(value);
    }
    last
}

fn report(app: &mut AppState, action: &str, result: Result<(), AudioError>) {
    app.message = Some(match result {
        Ok(()) => format!("{action}: ok"),
        Err(err) => format!("{action}: {err}"),
    });
}

fn handle_key(app: &mut AppState, key: KeyEvent) -> bool {
    match key.code {
        KeyCode::Char('q') => return true,
        KeyCode::Up => {
            if app.selected > 0 {
                app.selected -= 1;
            }
        }
        KeyCode::Down => {
            if let Some(status) = &app.status {
                if app.selected + 1 < status.streams.len() {
                    app.selected += 1;
                }
            }
        }
        KeyCode::Char('s') => report(app, "start", api::start_engine()),
        KeyCode::Char('x') => report(app, "stop", api::stop_engine()),
        KeyCode::Char('p') => report(app, "pause", api::pause_engine()),
        KeyCode::Char('r') => report(app, "resume", api::resume_engine()),
        KeyCode::Char('t') => {
            app.message = Some(match api::toggle_tone() {
                Ok(true) => "Tone client playing".to_string(),
                Ok(false) => "Tone client stopped".to_string(),
                Err(err) => format!("tone: {err}"),
            });
        }
        KeyCode::Char('f') => {
            if let Some(stream) = current_stream(app) {
                app.message = Some(match api::toggle_stream_format(stream.id) {
                    Ok(format) => format!(
                        "Stream {} now {}-bit {:?}",
                        stream.id.0, format.bit_width, format.numeric_representation
                    ),
                    Err(err) => format!("format: {err}"),
                });
            }
        }
        _ => {}
    }
    false
}

fn current_stream(app: &AppState) -> Option<StreamInfo> {
    app.status.as_ref()?.streams.get(app.selected).cloned()
}

fn draw(frame: &mut ratatui::Frame<'_>, app: &AppState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(4),
            Constraint::Min(6),
            Constraint::Length(LOG_LINES as u16 + 2),
            Constraint::Length(3),
        ])
        .split(frame.size());

    draw_header(frame, chunks[0], app);
    draw_streams(frame, chunks[1], app);
    draw_log(frame, chunks[2], app);
    draw_footer(frame, chunks[3], app);
}

fn state_style(state: EngineState) -> Style {
    match state {
        EngineState::Running | EngineState::Resumed => Style::default().fg(Color::Green),
        EngineState::Paused => Style::default().fg(Color::Yellow),
        EngineState::Stopped => Style::default().fg(Color::Red),
    }
    .add_modifier(Modifier::BOLD)
}

fn draw_header(frame: &mut ratatui::Frame<'_>, area: ratatui::prelude::Rect, app: &AppState) {
    let block = Block::default()
        .title("Audio Engine Console")
        .borders(Borders::ALL);

    let content = if let Some(status) = &app.status {
        let stop = match status.stop_position {
            Some(stop) => format!("{}:{}", stop.loop_count, stop.sample_frame),
            None => "-".to_string(),
        };
        let state = Line::from(vec![
            Span::raw("State: "),
            Span::styled(format!("{:?}", status.state), state_style(status.state)),
            Span::raw(format!(
                "    Pauses: {}    Clients: {}    Stop at: {}",
                status.pause_count, status.active_clients, stop
            )),
        ]);
        let stats = Line::from(format!(
            "Sample Rate: {} Hz    Ring: {} frames    Position: {}:{}    Last wrap: {} ns",
            status.sample_rate,
            status.frames_per_buffer,
            status.position.loop_count,
            status.position.sample_frame,
            status.last_loop_time_ns,
        ));
        Paragraph::new(vec![state, stats])
    } else {
        Paragraph::new(Line::from(vec![Span::styled(
            "No active engine",
            Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
        )]))
    };

    frame.render_widget(content.block(block), area);
}

fn position_cell(position: Position) -> Cell<'static> {
    match position {
        Position::At(at) => Cell::from(format!("{}:{}", at.loop_count, at.sample_frame)),
        Position::Unset => Cell::from("-"),
    }
}

fn draw_streams(frame: &mut ratatui::Frame<'_>, area: ratatui::prelude::Rect, app: &AppState) {
    let block = Block::default().title("Streams").borders(Borders::ALL);

    if let Some(status) = &app.status {
        let header = Row::new(vec![
            Cell::from(""),
            Cell::from("Id"),
            Cell::from("Dir"),
            Cell::from("Channel"),
            Cell::from("Format"),
            Cell::from("Mixable"),
            Cell::from("Clients"),
            Cell::from("Clipped"),
        ])
        .style(
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        );

        let rows = status.streams.iter().enumerate().map(|(idx, stream)| {
            let indicator = if idx == app.selected { ">" } else { "" };
            let direction = match stream.direction {
                StreamDirection::Output => "out",
                StreamDirection::Input => "in",
            };
            let mut row = Row::new(vec![
                Cell::from(indicator.to_string()),
                Cell::from(format!("{}", stream.id.0)),
                Cell::from(direction),
                Cell::from(format!("{}", stream.starting_channel_id)),
                Cell::from(format!(
                    "{}ch {}-bit {:?}",
                    stream.format.num_channels,
                    stream.format.bit_width,
                    stream.format.numeric_representation
                )),
                Cell::from(if stream.format.is_mixable { "Yes" } else { "No" }),
                Cell::from(format!("{}", stream.num_clients)),
                position_cell(stream.clipped_position),
            ]);
            if idx == app.selected {
                row = row.style(Style::default().fg(Color::Yellow));
            }
            row
        });

        let table = Table::new(
            rows,
            [
                Constraint::Length(2),
                Constraint::Length(4),
                Constraint::Length(4),
                Constraint::Length(8),
                Constraint::Length(24),
                Constraint::Length(8),
                Constraint::Length(8),
                Constraint::Length(14),
            ],
        )
        .header(header)
        .block(block)
        .column_spacing(2);

        frame.render_widget(table, area);
    } else {
        frame.render_widget(Paragraph::new("").block(block), area);
    }
}

fn draw_log(frame: &mut ratatui::Frame<'_>, area: ratatui::prelude::Rect, app: &AppState) {
    let lines: Vec<Line> = app
        .log
        .iter()
        .map(|line| Line::from(Span::styled(line.clone(), Style::default().fg(Color::Gray))))
        .collect();
    let paragraph = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title("Events"))
        .wrap(Wrap { trim: true });
    frame.render_widget(paragraph, area);
}

fn draw_footer(frame: &mut ratatui::Frame<'_>, area: ratatui::prelude::Rect, app: &AppState) {
    let info = "s: Start  x: Stop  p: Pause  r: Resume  t: Tone  f: Toggle format  q: Quit";
    let mut lines = vec![Line::from(info)];
    if let Some(message) = &app.message {
        lines.push(Line::from(Span::styled(
            message.clone(),
            Style::default().fg(Color::Green),
        )));
    } else if let Some(updated) = app.last_update {
        let ago = updated.elapsed().as_secs_f32();
        lines.push(Line::from(Span::styled(
            format!("Last update {:.1}s ago", ago),
            Style::default().fg(Color::DarkGray),
        )));
    }

    let paragraph = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title("Help"))
        .wrap(Wrap { trim: true });
    frame.render_widget(paragraph, area);
}
