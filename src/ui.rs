use ratatui::{
    layout::{Constraint, Layout, Rect},
    style::{Color, Modifier, Style, Stylize},
    text::{Line, Span, Text},
    widgets::{Block, Borders, Clear, List, ListItem, Paragraph, Wrap},
    Frame,
};

use crate::app::{App, InputMode};
use crate::chat::{ChatMessage, ChatRole};
use crate::persona::Persona;

pub fn render(app: &mut App, frame: &mut Frame) {
    let area = frame.area();

    let [header_area, chat_area, input_area, footer_area] = Layout::vertical([
        Constraint::Length(1),
        Constraint::Min(0),
        Constraint::Length(3),
        Constraint::Length(1),
    ])
    .areas(area);

    render_header(app, frame, header_area);
    render_chat(app, frame, chat_area);
    render_input(app, frame, input_area);
    render_footer(app, frame, footer_area);

    if app.show_persona_picker {
        render_persona_picker(app, frame, area);
    }
}

fn render_header(app: &App, frame: &mut Frame, area: Rect) {
    let title = Line::from(vec![
        Span::styled(" Sugya ", Style::default().fg(Color::Cyan).bold()),
        Span::styled(
            format!(" learning with {} ", app.persona.display_name()),
            Style::default().fg(persona_color(Some(app.persona))),
        ),
        Span::raw(" "),
        Span::styled(
            format!("v{}", env!("CARGO_PKG_VERSION")),
            Style::default().fg(Color::DarkGray),
        ),
    ]);

    let header = Paragraph::new(title).style(Style::default().bg(Color::DarkGray));
    frame.render_widget(header, area);
}

fn persona_color(persona: Option<Persona>) -> Color {
    match persona {
        Some(Persona::Chavruta) => Color::Yellow,
        Some(Persona::Hillel) => Color::Green,
        Some(Persona::Shammai) => Color::Red,
        None => Color::Gray,
    }
}

fn message_label(msg: &ChatMessage) -> Span<'static> {
    match msg.role {
        ChatRole::User => Span::styled(
            "You:",
            Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
        ),
        _ => {
            let name = msg
                .persona
                .map(|p| p.display_name())
                .unwrap_or("Companion");
            Span::styled(
                format!("{name}:"),
                Style::default()
                    .fg(persona_color(msg.persona))
                    .add_modifier(Modifier::BOLD),
            )
        }
    }
}

/// Render `**bold**` markers as styled spans; everything else is literal.
/// An unbalanced trailing marker is kept as text.
fn styled_line(text: &str) -> Line<'static> {
    let pieces: Vec<&str> = text.split("**").collect();
    let balanced = pieces.len() % 2 == 1;
    let mut spans: Vec<Span<'static>> = Vec::new();

    for (i, piece) in pieces.iter().enumerate() {
        let last = i == pieces.len() - 1;
        if i % 2 == 1 && (balanced || !last) {
            if !piece.is_empty() {
                spans.push(Span::styled(
                    piece.to_string(),
                    Style::default().add_modifier(Modifier::BOLD),
                ));
            }
        } else if i % 2 == 1 {
            // Lone opener: restore the marker literally.
            spans.push(Span::raw(format!("**{piece}")));
        } else if !piece.is_empty() {
            spans.push(Span::raw(piece.to_string()));
        }
    }

    if spans.is_empty() {
        Line::default()
    } else {
        Line::from(spans)
    }
}

/// Build the chat transcript lines. `app.scroll_chat_to_bottom` mirrors this
/// layout when it counts lines.
fn chat_lines(app: &App) -> Vec<Line<'static>> {
    let mut lines: Vec<Line> = Vec::new();

    for msg in app.conversation.messages() {
        lines.push(Line::from(message_label(msg)));

        if msg.streaming && msg.content.is_empty() {
            let dots = ".".repeat((app.animation_frame as usize) + 1);
            lines.push(Line::from(Span::styled(
                format!("Thinking{dots}"),
                Style::default()
                    .fg(Color::DarkGray)
                    .add_modifier(Modifier::ITALIC),
            )));
        } else {
            match msg.role {
                ChatRole::User => {
                    for line in msg.content.lines() {
                        lines.push(Line::from(line.to_string()));
                    }
                }
                _ => {
                    for line in msg.content.lines() {
                        lines.push(styled_line(line));
                    }
                }
            }
            if msg.content.is_empty() {
                lines.push(Line::default());
            }
        }
        lines.push(Line::default());
    }

    lines
}

fn render_chat(app: &mut App, frame: &mut Frame, area: Rect) {
    // Inner dimensions feed the scroll-to-bottom wrap math.
    app.chat_height = area.height.saturating_sub(2);
    app.chat_width = area.width.saturating_sub(2);

    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::DarkGray))
        .title(" Sugya ");

    let text = if app.conversation.is_empty() {
        Text::from(Span::styled(
            app.persona.placeholder(),
            Style::default().fg(Color::DarkGray),
        ))
    } else {
        Text::from(chat_lines(app))
    };

    let chat = Paragraph::new(text)
        .block(block)
        .wrap(Wrap { trim: true })
        .scroll((app.chat_scroll, 0));

    frame.render_widget(chat, area);
}

fn render_input(app: &App, frame: &mut Frame, area: Rect) {
    let (border_color, title) = if app.busy {
        (Color::DarkGray, " Waiting for the reply... ")
    } else if app.input_mode == InputMode::Editing {
        (Color::Yellow, " Ask (Enter to send) ")
    } else {
        (Color::DarkGray, " Ask (i to edit) ")
    };

    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(border_color))
        .title(title);

    // Horizontal scroll keeps the cursor visible in a long question.
    let inner_width = area.width.saturating_sub(2) as usize;
    let scroll_offset = if inner_width == 0 || app.cursor < inner_width {
        0
    } else {
        app.cursor - inner_width + 1
    };

    let visible_text: String = app
        .input
        .chars()
        .skip(scroll_offset)
        .take(inner_width)
        .collect();

    let input = Paragraph::new(visible_text)
        .style(Style::default().fg(Color::Cyan))
        .block(block);
    frame.render_widget(input, area);

    if app.input_mode == InputMode::Editing && !app.busy {
        let cursor_x = (app.cursor - scroll_offset) as u16;
        frame.set_cursor_position((area.x + cursor_x + 1, area.y + 1));
    }
}

fn render_footer(app: &App, frame: &mut Frame, area: Rect) {
    let key_style = Style::default().bg(Color::DarkGray).fg(Color::White);
    let label_style = Style::default().bg(Color::Black).fg(Color::White);

    let mode_span = match app.input_mode {
        InputMode::Normal => Span::styled(" CHAT ", Style::default().bg(Color::Blue).fg(Color::White)),
        InputMode::Editing => Span::styled(" ASK ", Style::default().bg(Color::Yellow).fg(Color::Black)),
    };

    let hints = match app.input_mode {
        InputMode::Normal => vec![
            Span::styled(" i ", key_style),
            Span::styled(" ask ", label_style),
            Span::styled(" j/k ", key_style),
            Span::styled(" scroll ", label_style),
            Span::styled(" P ", key_style),
            Span::styled(" persona ", label_style),
            Span::styled(" ^N ", key_style),
            Span::styled(" new sugya ", label_style),
            Span::styled(" q ", key_style),
            Span::styled(" quit ", label_style),
        ],
        InputMode::Editing => vec![
            Span::styled(" Enter ", key_style),
            Span::styled(" send ", label_style),
            Span::styled(" Esc ", key_style),
            Span::styled(" stop typing ", label_style),
            Span::styled(" ^N ", key_style),
            Span::styled(" new sugya ", label_style),
        ],
    };

    let footer_content = Line::from(
        vec![mode_span, Span::styled(" ", label_style)]
            .into_iter()
            .chain(hints)
            .collect::<Vec<_>>(),
    );

    let footer = Paragraph::new(footer_content).style(Style::default().bg(Color::Black));
    frame.render_widget(footer, area);
}

fn render_persona_picker(app: &mut App, frame: &mut Frame, area: Rect) {
    let personas = Persona::all();

    let popup_width = 44.min(area.width.saturating_sub(4));
    let popup_height = (personas.len() as u16 + 2).min(area.height.saturating_sub(4));
    let popup_x = (area.width.saturating_sub(popup_width)) / 2;
    let popup_y = (area.height.saturating_sub(popup_height)) / 2;
    let popup_area = Rect::new(popup_x, popup_y, popup_width, popup_height);

    frame.render_widget(Clear, popup_area);

    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan))
        .title(" Choose a persona ");

    let items: Vec<ListItem> = personas
        .iter()
        .map(|p| {
            ListItem::new(Line::from(vec![
                Span::styled(
                    format!(" {} ", p.display_name()),
                    Style::default().fg(persona_color(Some(*p))),
                ),
                Span::styled(
                    match p {
                        Persona::Chavruta => "study partner",
                        Persona::Hillel => "the lenient school",
                        Persona::Shammai => "the strict school",
                    },
                    Style::default().fg(Color::DarkGray),
                ),
            ]))
        })
        .collect();

    let list = List::new(items)
        .block(block)
        .highlight_style(
            Style::default()
                .bg(Color::Blue)
                .fg(Color::White)
                .add_modifier(Modifier::BOLD),
        )
        .highlight_symbol("> ");

    frame.render_stateful_widget(list, popup_area, &mut app.persona_state);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span_texts(line: &Line) -> Vec<String> {
        line.spans.iter().map(|s| s.content.to_string()).collect()
    }

    #[test]
    fn styled_line_splits_bold_segments() {
        let line = styled_line("The **mishna** rules otherwise");
        assert_eq!(
            span_texts(&line),
            vec!["The ", "mishna", " rules otherwise"]
        );
        assert!(line.spans[1].style.add_modifier.contains(Modifier::BOLD));
        assert!(!line.spans[0].style.add_modifier.contains(Modifier::BOLD));
    }

    #[test]
    fn styled_line_keeps_unbalanced_marker_literal() {
        let line = styled_line("an unmatched **opener");
        assert_eq!(span_texts(&line), vec!["an unmatched ", "**opener"]);
        assert!(!line.spans[1].style.add_modifier.contains(Modifier::BOLD));
    }

    #[test]
    fn styled_line_handles_plain_and_empty_text() {
        assert_eq!(span_texts(&styled_line("plain")), vec!["plain"]);
        assert!(styled_line("").spans.is_empty());
    }
}
