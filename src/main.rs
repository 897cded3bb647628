//! Mood Mask - Main Entry Point
//!
//! A camera booth that draws a character mask over the live video. Masks are
//! picked from the soundboard or, with mood detection on, from the facial
//! expression of whoever is in front of the camera.

use std::sync::Arc;

use mood_mask::{App, Settings};
use winit::application::ApplicationHandler;
use winit::dpi::LogicalSize;
use winit::event::{ElementState, KeyEvent, WindowEvent};
use winit::event_loop::{ActiveEventLoop, ControlFlow, EventLoop};
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::window::{Window, WindowAttributes, WindowId};

const DEFAULT_WIDTH: u32 = 1280;
const DEFAULT_HEIGHT: u32 = 800;

const SOUND_KEYS: [KeyCode; 9] = [
    KeyCode::Digit1,
    KeyCode::Digit2,
    KeyCode::Digit3,
    KeyCode::Digit4,
    KeyCode::Digit5,
    KeyCode::Digit6,
    KeyCode::Digit7,
    KeyCode::Digit8,
    KeyCode::Digit9,
];

/// Application state machine
enum AppState {
    /// Initial state before window is created
    Uninitialized { settings: Settings },
    /// Window and graphics context are ready
    Running { window: Arc<Window>, app: App },
    /// Startup failed or the app has shut down
    Exited,
}

/// Main application handler implementing winit's ApplicationHandler trait
struct MoodMaskApp {
    state: AppState,
}

impl MoodMaskApp {
    fn new(settings: Settings) -> Self {
        Self {
            state: AppState::Uninitialized { settings },
        }
    }

    fn exit(&mut self, event_loop: &ActiveEventLoop) {
        if let AppState::Running { app, .. } = &mut self.state {
            app.shutdown();
        }
        self.state = AppState::Exited;
        event_loop.exit();
    }
}

impl ApplicationHandler for MoodMaskApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        // Only initialize if we haven't already
        let AppState::Uninitialized { settings } = &self.state else {
            return;
        };
        let settings = settings.clone();

        log::info!("Creating window...");

        let window_attributes = WindowAttributes::default()
            .with_title(mood_mask::app::TITLE)
            .with_inner_size(LogicalSize::new(DEFAULT_WIDTH, DEFAULT_HEIGHT));

        let window = match event_loop.create_window(window_attributes) {
            Ok(window) => Arc::new(window),
            Err(e) => {
                log::error!("Failed to create window: {}", e);
                self.exit(event_loop);
                return;
            }
        };

        log::info!(
            "Window created: {}x{}",
            window.inner_size().width,
            window.inner_size().height
        );

        log::info!("Initializing wgpu and egui...");
        match pollster::block_on(App::new(window.clone(), settings)) {
            Ok(app) => {
                log::info!("Mood Mask ready!");
                log::info!("ESC to exit, F11 for fullscreen, M for mood detection, 1-9 for sounds");
                window.request_redraw();
                self.state = AppState::Running { window, app };
            }
            Err(e) => {
                log::error!("Failed to start: {}", e);
                self.exit(event_loop);
            }
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _window_id: WindowId,
        event: WindowEvent,
    ) {
        let AppState::Running { window, app } = &mut self.state else {
            return;
        };

        // Let egui handle the event first
        let egui_consumed = app.handle_window_event(&event);

        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, exiting...");
                self.exit(event_loop);
            }

            // Handle keyboard input (only if egui doesn't want it)
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        physical_key: PhysicalKey::Code(key_code),
                        state: ElementState::Pressed,
                        repeat: false,
                        ..
                    },
                ..
            } if !egui_consumed => match key_code {
                KeyCode::Escape => {
                    log::info!("Escape pressed, exiting...");
                    self.exit(event_loop);
                }
                KeyCode::F11 => {
                    if window.fullscreen().is_some() {
                        window.set_fullscreen(None);
                        log::info!("Exiting fullscreen");
                    } else {
                        window.set_fullscreen(Some(winit::window::Fullscreen::Borderless(None)));
                        log::info!("Entering fullscreen");
                    }
                }
                KeyCode::KeyM => app.toggle_mood_detection(),
                key => {
                    if let Some(index) = SOUND_KEYS.iter().position(|k| *k == key) {
                        app.trigger_sound(index);
                    }
                }
            },

            WindowEvent::Resized(physical_size) => {
                app.resize(physical_size);
            }

            WindowEvent::RedrawRequested => {
                app.update();

                match app.render() {
                    Ok(_) => {}
                    Err(wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated) => {
                        log::warn!("Surface lost, reconfiguring...");
                        app.resize(app.size());
                    }
                    Err(wgpu::SurfaceError::OutOfMemory) => {
                        log::error!("Out of GPU memory!");
                        self.exit(event_loop);
                    }
                    Err(e) => {
                        log::warn!("Surface error: {:?}", e);
                    }
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        // Fifo presentation paces redraws to the display
        if let AppState::Running { window, .. } = &self.state {
            window.request_redraw();
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    log::info!("Mood Mask v{}", env!("CARGO_PKG_VERSION"));

    let settings = Settings::load_or_default();

    let event_loop = match EventLoop::new() {
        Ok(event_loop) => event_loop,
        Err(e) => {
            log::error!("Failed to create event loop: {}", e);
            std::process::exit(1);
        }
    };
    event_loop.set_control_flow(ControlFlow::Wait);

    let mut app = MoodMaskApp::new(settings);
    if let Err(e) = event_loop.run_app(&mut app) {
        log::error!("Event loop error: {}", e);
        std::process::exit(1);
    }
}
