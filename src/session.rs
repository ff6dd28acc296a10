//! Headless driver for the feed core.
//!
//! Reads line commands, multiplexes them with background events and a
//! periodic tick, and prints state changes. Each listing is laid out as one
//! full-height page, so `next`/`prev` snap between items and `scroll` moves
//! by pixels.

use crate::controller::{FeedController, FeedEvent};
use crate::playback::{MediaError, MediaOpener, Player, PlayerHandle, SlotId, SlotState};
use crate::viewability::{ItemGeometry, Viewport};
use anyhow::Result;
use async_trait::async_trait;
use std::io::Write;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Height of one listing page and of the viewport.
pub const PAGE_LENGTH: f32 = 800.0;

// ============================================================================
// Commands
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Scroll(f32),
    Next,
    Prev,
    Focus(bool),
    Like(String),
    Save(String),
    Retry(SlotId),
    Mute(bool),
    Refresh,
    State,
    Quit,
}

#[derive(Debug, Error, PartialEq)]
pub enum CommandError {
    #[error("Unknown command: {0}")]
    Unknown(String),
    #[error("Missing argument for {0}")]
    MissingArgument(&'static str),
    #[error("Invalid argument for {command}: {value}")]
    InvalidArgument { command: &'static str, value: String },
}

fn parse_switch(command: &'static str, value: Option<&str>) -> Result<bool, CommandError> {
    match value {
        Some("on") => Ok(true),
        Some("off") => Ok(false),
        Some(other) => Err(CommandError::InvalidArgument {
            command,
            value: other.to_string(),
        }),
        None => Err(CommandError::MissingArgument(command)),
    }
}

impl std::str::FromStr for Command {
    type Err = CommandError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut parts = line.split_whitespace();
        let Some(name) = parts.next() else {
            return Err(CommandError::Unknown(String::new()));
        };
        let arg = parts.next();

        match name {
            "scroll" => {
                let value = arg.ok_or(CommandError::MissingArgument("scroll"))?;
                value
                    .parse::<f32>()
                    .ok()
                    .filter(|px| px.is_finite())
                    .map(Command::Scroll)
                    .ok_or_else(|| CommandError::InvalidArgument {
                        command: "scroll",
                        value: value.to_string(),
                    })
            }
            "next" => Ok(Command::Next),
            "prev" => Ok(Command::Prev),
            "focus" => parse_switch("focus", arg).map(Command::Focus),
            "mute" => parse_switch("mute", arg).map(Command::Mute),
            "like" => arg
                .map(|id| Command::Like(id.to_string()))
                .ok_or(CommandError::MissingArgument("like")),
            "save" => arg
                .map(|id| Command::Save(id.to_string()))
                .ok_or(CommandError::MissingArgument("save")),
            "retry" => {
                let value = arg.ok_or(CommandError::MissingArgument("retry"))?;
                value
                    .parse::<SlotId>()
                    .map(Command::Retry)
                    .map_err(|_| CommandError::InvalidArgument {
                        command: "retry",
                        value: value.to_string(),
                    })
            }
            "refresh" => Ok(Command::Refresh),
            "state" => Ok(Command::State),
            "quit" | "exit" => Ok(Command::Quit),
            other => Err(CommandError::Unknown(other.to_string())),
        }
    }
}

// ============================================================================
// Headless Media
// ============================================================================

/// Player that only logs what a real decoder would do.
#[derive(Debug)]
pub struct LoggingPlayer {
    media_ref: String,
}

impl Player for LoggingPlayer {
    fn play(&mut self) {
        tracing::info!(media = %self.media_ref, "play");
    }

    fn pause(&mut self) {
        tracing::debug!(media = %self.media_ref, "pause");
    }

    fn set_muted(&mut self, muted: bool) {
        tracing::debug!(media = %self.media_ref, muted, "set_muted");
    }

    fn release(&mut self) {
        tracing::debug!(media = %self.media_ref, "release");
    }
}

/// Opens media by checking the URL answers a `HEAD` request.
#[derive(Debug, Clone)]
pub struct HeadlessOpener {
    client: reqwest::Client,
    timeout: Duration,
}

impl HeadlessOpener {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl MediaOpener for HeadlessOpener {
    async fn open(&self, media_ref: &str) -> Result<PlayerHandle, MediaError> {
        let response = tokio::time::timeout(self.timeout, self.client.head(media_ref).send())
            .await
            .map_err(|_| MediaError::Timeout)?
            .map_err(|e| MediaError::Open(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(MediaError::NotFound);
        }
        if !status.is_success() {
            return Err(MediaError::Open(format!("status {}", status.as_u16())));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if content_type.starts_with("text/") {
            return Err(MediaError::Unsupported(content_type.to_string()));
        }

        Ok(Box::new(LoggingPlayer {
            media_ref: media_ref.to_string(),
        }))
    }
}

// ============================================================================
// Event Loop
// ============================================================================

/// Headless feed screen.
pub struct Session<W> {
    controller: FeedController,
    events: mpsc::Receiver<FeedEvent>,
    out: W,
    scroll_offset: f32,
    geometry: Vec<ItemGeometry>,
    shown_active: Option<usize>,
    shown_slots: Vec<SlotState>,
}

impl<W: Write> Session<W> {
    pub fn new(controller: FeedController, events: mpsc::Receiver<FeedEvent>, out: W) -> Self {
        Self {
            controller,
            events,
            out,
            scroll_offset: 0.0,
            geometry: Vec::new(),
            shown_active: None,
            shown_slots: Vec::new(),
        }
    }

    pub fn controller(&self) -> &FeedController {
        &self.controller
    }

    pub fn into_output(self) -> W {
        self.out
    }

    /// Run until `quit`, Ctrl-C, or end of input. Tears the feed down on
    /// exit, including when input or output fails.
    pub async fn run<R>(&mut self, input: R, tick: Duration) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        self.controller.load_initial();
        let outcome = self.drive(input, tick).await;
        if let Err(e) = &outcome {
            tracing::error!(error = %e, "Session loop failed");
        }

        self.controller.teardown();
        let finished = self.sync().and_then(|()| Ok(writeln!(self.out, "bye")?));
        outcome.and(finished)
    }

    async fn drive<R>(&mut self, input: R, tick: Duration) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = input.split(b'\n');
        let mut ticker = tokio::time::interval(tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            // Drain background results before taking more input
            while let Ok(event) = self.events.try_recv() {
                self.controller.handle_event(event);
            }
            self.sync()?;

            tokio::select! {
                biased;

                _ = &mut ctrl_c => {
                    tracing::info!("Received Ctrl-C, shutting down");
                    return Ok(());
                }

                segment = lines.next_segment() => {
                    let Some(bytes) = segment? else {
                        tracing::info!("Input closed, shutting down");
                        return Ok(());
                    };
                    let line = match String::from_utf8(bytes) {
                        Ok(line) => line,
                        Err(e) => {
                            writeln!(self.out, "error: input is not valid UTF-8: {}", e.utf8_error())?;
                            continue;
                        }
                    };
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match line.parse::<Command>() {
                        Ok(Command::Quit) => return Ok(()),
                        Ok(command) => self.apply(command)?,
                        Err(e) => writeln!(self.out, "error: {e}")?,
                    }
                }

                Some(event) = self.events.recv() => {
                    self.controller.handle_event(event);
                }

                _ = ticker.tick() => {
                    self.controller.tick(Instant::now());
                }
            }
        }
    }

    fn apply(&mut self, command: Command) -> Result<()> {
        let now = Instant::now();
        match command {
            Command::Scroll(px) => self.scroll_to(self.scroll_offset + px),
            Command::Next => self.scroll_to(self.page_index() as f32 * PAGE_LENGTH + PAGE_LENGTH),
            Command::Prev => self.scroll_to(self.page_index().saturating_sub(1) as f32 * PAGE_LENGTH),
            Command::Focus(focused) => self.controller.on_focus_changed(focused, now),
            Command::Like(id) => {
                if !self.controller.toggle_like(&id) {
                    writeln!(self.out, "error: no listing {id}")?;
                }
            }
            Command::Save(id) => {
                if !self.controller.toggle_save(&id) {
                    writeln!(self.out, "error: no listing {id}")?;
                }
            }
            Command::Retry(slot_id) => {
                if !self.controller.retry(slot_id) {
                    writeln!(self.out, "error: slot {slot_id} is not errored")?;
                }
            }
            Command::Mute(muted) => self.controller.set_muted(muted),
            Command::Refresh => self.controller.refresh(),
            Command::State => self.print_state()?,
            Command::Quit => {}
        }
        Ok(())
    }

    fn page_index(&self) -> usize {
        (self.scroll_offset / PAGE_LENGTH).round().max(0.0) as usize
    }

    fn scroll_to(&mut self, offset: f32) {
        let max = (self.geometry.len().saturating_sub(1)) as f32 * PAGE_LENGTH;
        self.scroll_offset = offset.clamp(0.0, max.max(0.0));
    }

    /// Re-run viewability for the current layout and print what changed.
    fn sync(&mut self) -> Result<()> {
        let len = self.controller.store().len();
        if self.geometry.len() != len {
            self.geometry = (0..len)
                .map(|i| ItemGeometry {
                    offset: i as f32 * PAGE_LENGTH,
                    length: PAGE_LENGTH,
                })
                .collect();
            self.scroll_to(self.scroll_offset);
        }

        let viewport = Viewport {
            scroll_offset: self.scroll_offset,
            length: PAGE_LENGTH,
        };
        let geometry = std::mem::take(&mut self.geometry);
        self.controller.on_scroll(&geometry, viewport, Instant::now());
        self.geometry = geometry;

        let active = self.controller.active_index();
        if active != self.shown_active {
            self.shown_active = active;
            match active.and_then(|i| self.controller.store().at(i)) {
                Some(item) => writeln!(self.out, "active {} {}", item.ordinal, item.id)?,
                None => writeln!(self.out, "active none")?,
            }
        }

        let slots: Vec<SlotState> = self.controller.scheduler().pool().iter().map(|s| s.state()).collect();
        if slots != self.shown_slots {
            for (slot_id, state) in slots.iter().enumerate() {
                if self.shown_slots.get(slot_id) != Some(state) {
                    writeln!(self.out, "slot {slot_id} {state:?}")?;
                }
            }
            self.shown_slots = slots;
        }

        for notice in self.controller.drain_notices() {
            writeln!(self.out, "notice: {notice}")?;
        }
        Ok(())
    }

    fn print_state(&mut self) -> Result<()> {
        let controller = &self.controller;
        writeln!(
            self.out,
            "items={} active={:?} focused={} loading={} more={}",
            controller.store().len(),
            controller.active_index(),
            controller.is_focused(),
            controller.is_loading(),
            controller.has_more()
        )?;
        for slot in controller.scheduler().pool().iter() {
            writeln!(
                self.out,
                "  slot {} {:?} item={} muted={}",
                slot.id(),
                slot.state(),
                slot.item_id().map(|id| &**id).unwrap_or("-"),
                slot.is_muted()
            )?;
        }
        if let Some(item) = controller.active_index().and_then(|i| controller.store().at(i)) {
            writeln!(
                self.out,
                "  {} liked={} ({}) saved={} ({}) viewed={}",
                item.id,
                item.local.liked,
                item.local.like_count,
                item.local.saved,
                item.local.save_count,
                controller.views().record(&item.id).is_some_and(|r| r.reported)
            )?;
        }
        Ok(())
    }
}
