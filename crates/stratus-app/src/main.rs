// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]
use anyhow::Result;
use clap::Parser;
use stratus_core::init_tracing;
use stratus_render::{BackendApi, RenderPacket, RenderSize, Renderer, RendererConfig};
use stratus_render_vk::VulkanBackend;
use tracing::{error, info, warn};

use stratus_platform::is_zero_sized;
use stratus_platform::winit::{
    application::ApplicationHandler,
    dpi::PhysicalSize,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::{Window, WindowId},
};

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use std::fs;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Renderer backend: vk | vulkan
    #[arg(long, default_value = "vulkan")]
    backend: BackendApi,

    /// TOML config file. Missing files fall back to defaults.
    #[arg(long, default_value = "stratus.toml")]
    config: PathBuf,

    #[arg(long)]
    width: Option<u32>,
    #[arg(long)]
    height: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct WindowCfg {
    title: String,
    width: u32,
    height: u32,
}

impl Default for WindowCfg {
    fn default() -> Self {
        WindowCfg {
            title: "stratus".into(),
            width: 1280,
            height: 720,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct AppCfg {
    #[serde(default)]
    window: WindowCfg,
    #[serde(default)]
    render: RendererConfig,
}

fn parse_cfg(text: &str) -> Result<AppCfg> {
    Ok(toml::from_str::<AppCfg>(text)?)
}

fn load_cfg(path: &Path) -> AppCfg {
    match fs::read_to_string(path) {
        Ok(s) => parse_cfg(&s).unwrap_or_else(|e| {
            warn!("{}: {e:#}; using defaults", path.display());
            AppCfg::default()
        }),
        Err(_) => {
            info!("no config at {}, using defaults", path.display());
            AppCfg::default()
        }
    }
}

fn render_size(size: PhysicalSize<u32>) -> RenderSize {
    RenderSize::new(size.width, size.height)
}

struct App {
    backend_choice: BackendApi,
    cfg: AppCfg,

    // Dropped before the window it draws into.
    renderer: Option<Renderer>,
    window: Option<Window>,

    exiting: bool,
    paused: bool,
    frames: u32,
    last_frame: Instant,
    last_fps_instant: Instant,
}

impl App {
    fn create_renderer(&self, window: &Window) -> Result<Renderer> {
        let size = render_size(window.inner_size());
        let backend = match self.backend_choice {
            BackendApi::Vulkan => VulkanBackend::initialize(
                &self.cfg.window.title,
                window,
                window,
                size,
                &self.cfg.render,
            )?,
        };
        Ok(Renderer::new(Box::new(backend)))
    }

    fn exit(&mut self, event_loop: &ActiveEventLoop) {
        self.exiting = true;
        if let Some(mut renderer) = self.renderer.take() {
            renderer.shutdown();
        }
        self.window = None;
        event_loop.exit();
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_none() {
            let attrs = Window::default_attributes()
                .with_title(self.cfg.window.title.clone())
                .with_inner_size(PhysicalSize::new(
                    self.cfg.window.width,
                    self.cfg.window.height,
                ));
            let window = match event_loop.create_window(attrs) {
                Ok(w) => w,
                Err(e) => {
                    error!("create_window failed: {e}");
                    event_loop.exit();
                    return;
                }
            };

            match self.create_renderer(&window) {
                Ok(renderer) => {
                    info!("backend = {:?}", renderer.api());
                    self.renderer = Some(renderer);
                }
                Err(e) => {
                    error!("renderer init failed: {e:#}");
                    self.exiting = true;
                    event_loop.exit();
                    return;
                }
            }

            self.paused = is_zero_sized(window.inner_size());
            self.window = Some(window);
        }

        event_loop.set_control_flow(ControlFlow::Poll);
        info!("resumed → paused={}", self.paused);

        if !self.paused {
            if let Some(w) = &self.window {
                w.request_redraw();
            }
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        event: WindowEvent,
    ) {
        if let Some(window) = &self.window {
            if window_id != window.id() {
                return;
            }
        }

        match event {
            WindowEvent::CloseRequested => {
                info!("CloseRequested");
                self.exit(event_loop);
            }

            WindowEvent::Resized(new_size) => {
                let now_paused = is_zero_sized(new_size);
                if self.paused != now_paused {
                    self.paused = now_paused;
                    info!(
                        "Resized → {}x{} (paused={})",
                        new_size.width, new_size.height, self.paused
                    );
                }

                // Zero sizes are forwarded too; the backend skips frames until
                // the window has area again.
                if let Some(renderer) = &mut self.renderer {
                    renderer.on_resized(render_size(new_size));
                }
                if !self.paused {
                    if let Some(w) = &self.window {
                        w.request_redraw();
                    }
                }
            }

            WindowEvent::Occluded(occluded) => {
                let size = self.window.as_ref().map(|w| w.inner_size());
                self.paused = occluded || size.is_some_and(is_zero_sized);
                info!("Occluded={} → paused={}", occluded, self.paused);
            }

            WindowEvent::RedrawRequested => {
                if self.exiting || self.paused {
                    return;
                }

                let now = Instant::now();
                let packet = RenderPacket {
                    delta: now.duration_since(self.last_frame).as_secs_f32(),
                };
                self.last_frame = now;

                let Some(renderer) = &mut self.renderer else {
                    return;
                };
                let before = renderer.frame_number();
                match renderer.draw_frame(&packet) {
                    Ok(()) => {
                        // count only frames that were actually rendered
                        if renderer.frame_number() != before {
                            self.frames = self.frames.saturating_add(1);
                        }
                    }
                    Err(e) => {
                        error!("render error: {e:#}");
                        self.exit(event_loop);
                    }
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        if self.exiting {
            return;
        }

        if self.paused {
            // minimized or occluded → sleep until the next event
            event_loop.set_control_flow(ControlFlow::Wait);
            self.frames = 0;
            return;
        }

        event_loop.set_control_flow(ControlFlow::Poll);
        if let Some(w) = &self.window {
            w.request_redraw();
        }

        let now = Instant::now();
        if now.duration_since(self.last_fps_instant).as_secs_f32() >= 1.0 {
            info!("fps ~ {}", self.frames);
            self.frames = 0;
            self.last_fps_instant = now;
        }
    }
}

fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut cfg = load_cfg(&args.config);
    if let Some(w) = args.width {
        cfg.window.width = w;
    }
    if let Some(h) = args.height {
        cfg.window.height = h;
    }

    let event_loop: EventLoop<()> = EventLoop::new()?;
    let now = Instant::now();
    let mut app = App {
        backend_choice: args.backend,
        cfg,
        renderer: None,
        window: None,
        exiting: false,
        paused: false,
        frames: 0,
        last_frame: now,
        last_fps_instant: now,
    };

    event_loop.run_app(&mut app)?;
    Ok(())
}
