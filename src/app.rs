use anyhow::Result;
use ratatui::widgets::ListState;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::chat::Conversation;
use crate::config::Config;
use crate::persona::{self, Persona};
use crate::stream::{
    wire_messages, BackendClient, ChatStreamService, StreamEvent, StreamParams,
};

/// Shown in place of a reply when the stream or request fails.
pub const ERROR_NOTICE: &str =
    "The study session hit a snag. Check that the backend is running, then ask again.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    Normal,
    Editing,
}

pub struct App {
    pub should_quit: bool,
    pub input_mode: InputMode,

    pub conversation: Conversation,
    pub persona: Persona,
    /// Startup persona; reset returns to it, since a persona pick lives only
    /// as long as the conversation it was made in.
    default_persona: Persona,

    // Question input
    pub input: String,
    pub cursor: usize,

    // Chat viewport (inner size, updated during render)
    pub chat_scroll: u16,
    pub chat_height: u16,
    pub chat_width: u16,

    /// One request in flight at a time; input is inactive while set.
    pub busy: bool,
    pub animation_frame: u8,

    // Persona picker popup
    pub show_persona_picker: bool,
    pub persona_state: ListState,

    client: BackendClient,
    service: ChatStreamService,
    stream_task: Option<JoinHandle<()>>,
    /// Id of the stream whose events we accept; bumped on every submit and
    /// on reset, so events from an aborted stream are dropped.
    current_stream: u64,
    use_streaming: bool,
    paced: bool,
}

impl App {
    pub fn new(
        config: &Config,
        base_url: &str,
        persona: Persona,
    ) -> Result<(Self, mpsc::UnboundedReceiver<(StreamEvent, u64)>)> {
        let client = BackendClient::new(base_url)?;
        let (service, rx) = ChatStreamService::new();

        let app = Self {
            should_quit: false,
            input_mode: InputMode::Editing,
            conversation: Conversation::new(),
            persona,
            default_persona: persona,
            input: String::new(),
            cursor: 0,
            chat_scroll: 0,
            chat_height: 0,
            chat_width: 0,
            busy: false,
            animation_frame: 0,
            show_persona_picker: false,
            persona_state: ListState::default(),
            client,
            service,
            stream_task: None,
            current_stream: 0,
            use_streaming: config.resolve_streaming(),
            paced: config.paced_reveal(),
        };
        Ok((app, rx))
    }

    /// Record the user's question and open the backend request. No-op while
    /// a reply is already in flight or when the input is empty.
    pub fn submit(&mut self) {
        if self.busy || self.input.trim().is_empty() {
            return;
        }

        let question = std::mem::take(&mut self.input);
        self.cursor = 0;
        self.input_mode = InputMode::Normal;

        self.conversation.push_user(question);
        let system = persona::system_prompt(self.persona);
        let messages = wire_messages(&system, self.conversation.messages());
        let stream_id = self.begin_response();

        let params = StreamParams {
            client: self.client.clone(),
            messages,
            stream_id,
            paced: self.paced,
        };

        let task = if self.use_streaming {
            self.service.spawn_stream(params)
        } else {
            // Non-streaming backend: one completed message, delivered through
            // the same channel so the controller has a single code path.
            self.service.spawn_complete(params)
        };
        self.stream_task = Some(task);
        self.scroll_chat_to_bottom();
    }

    /// Append the streaming placeholder, mark the app busy, and allocate the
    /// id that incoming events must carry.
    fn begin_response(&mut self) -> u64 {
        self.current_stream += 1;
        self.conversation.begin_streaming(self.persona);
        self.busy = true;
        self.current_stream
    }

    /// Fold one decoded event into the conversation. Events from a stream
    /// other than the current one (aborted by reset) are ignored.
    pub fn handle_stream_event(&mut self, event: StreamEvent, stream_id: u64) {
        if stream_id != self.current_stream {
            debug!(stream_id, current = self.current_stream, "dropping stale stream event");
            return;
        }

        match event {
            StreamEvent::Delta(text) => {
                self.conversation.append_to_streaming(&text);
            }
            StreamEvent::Done => {
                self.conversation.finalize_streaming();
                self.finish_request();
            }
            StreamEvent::Error(message) => {
                debug!("stream failed: {message}");
                self.conversation.remove_streaming();
                self.conversation.push_assistant(ERROR_NOTICE.to_string(), None);
                self.finish_request();
            }
        }
        self.scroll_chat_to_bottom();
    }

    /// Cleanup shared by every terminal path; the input surface must never
    /// stay stuck disabled.
    fn finish_request(&mut self) {
        self.busy = false;
        self.stream_task = None;
        self.input_mode = InputMode::Editing;
    }

    /// Start a fresh sugya: abort the in-flight request, drop its queued
    /// events via the stream-id bump, and clear all conversation state.
    pub fn reset(&mut self) {
        if let Some(task) = self.stream_task.take() {
            task.abort();
        }
        self.current_stream += 1;
        self.conversation.clear();
        self.persona = self.default_persona;
        self.busy = false;
        self.input.clear();
        self.cursor = 0;
        self.chat_scroll = 0;
        self.input_mode = InputMode::Editing;
    }

    pub fn tick_animation(&mut self) {
        if self.busy {
            self.animation_frame = (self.animation_frame + 1) % 3;
        }
    }

    // Chat scrolling

    pub fn scroll_up(&mut self) {
        self.chat_scroll = self.chat_scroll.saturating_sub(1);
    }

    pub fn scroll_down(&mut self) {
        self.chat_scroll = self.chat_scroll.saturating_add(1);
    }

    /// Keep the newest content visible after every conversation mutation.
    /// Mirrors the wrap math in `ui::chat_lines`: one label line per message,
    /// wrapped content lines, a blank line between messages, and the
    /// Thinking... line while a reply is pending.
    pub fn scroll_chat_to_bottom(&mut self) {
        let wrap_width = if self.chat_width > 0 {
            self.chat_width as usize
        } else {
            60
        };

        let mut total_lines: u16 = 0;
        for msg in self.conversation.messages() {
            total_lines += 1; // label line
            if msg.streaming && msg.content.is_empty() {
                total_lines += 1; // Thinking...
            } else {
                for line in msg.content.lines() {
                    let chars = line.chars().count();
                    total_lines += chars.div_ceil(wrap_width).max(1) as u16;
                }
                if msg.content.is_empty() {
                    total_lines += 1;
                }
            }
            total_lines += 1; // blank separator
        }

        let visible = if self.chat_height > 0 {
            self.chat_height
        } else {
            20
        };
        self.chat_scroll = total_lines.saturating_sub(visible);
    }

    // Persona picker

    pub fn open_persona_picker(&mut self) {
        let current = Persona::all()
            .iter()
            .position(|p| *p == self.persona)
            .unwrap_or(0);
        self.persona_state.select(Some(current));
        self.show_persona_picker = true;
    }

    pub fn persona_picker_nav_down(&mut self) {
        let len = Persona::all().len();
        let i = self.persona_state.selected().unwrap_or(0);
        self.persona_state.select(Some((i + 1).min(len - 1)));
    }

    pub fn persona_picker_nav_up(&mut self) {
        let i = self.persona_state.selected().unwrap_or(0);
        self.persona_state.select(Some(i.saturating_sub(1)));
    }

    pub fn choose_persona(&mut self) {
        if let Some(i) = self.persona_state.selected() {
            if let Some(&persona) = Persona::all().get(i) {
                self.persona = persona;
                let _ = Config::save_persona(persona);
            }
        }
        self.show_persona_picker = false;
    }
}
