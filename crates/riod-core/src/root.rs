//! Root assembly: wires the scene subsystem, terminals, routes, and the
//! control surface into one tree and hands back the `FileServer` a
//! transport drives.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use crate::config::RioConfig;
use crate::error::{FsError, FsResult};
use crate::exec::{ExecutionContext, Executor};
use crate::fs::{CtlFile, CtlHandler, Dir, FileServer, OutputStream, StreamMode};
use crate::routes::{RoutesFile, RoutesManager};
use crate::sandbox::Sandbox;
use crate::scene::{
    ContextFile, ExecPipeline, ParseFile, SceneCtlHandler, SceneManager, ScreenFile, StateFile,
    StreamOutFile, VarsFile, VersionFile,
};
use crate::term::TermsDir;

pub struct RioRoot {
    pub config: RioConfig,
    pub dir: Arc<Dir>,
    pub server: Arc<FileServer>,
    pub scene: Arc<Mutex<SceneManager>>,
    pub context: Arc<Mutex<ExecutionContext>>,
    pub pipeline: Arc<ExecPipeline>,
    pub terms: Arc<TermsDir>,
    pub routes: Arc<RoutesManager>,
    pub sandbox: Arc<Sandbox>,
}

impl RioRoot {
    pub fn new(config: RioConfig) -> Arc<Self> {
        let scene = Arc::new(Mutex::new(SceneManager::new(&config)));
        let context = Arc::new(Mutex::new(ExecutionContext::new(&config)));
        let sandbox = Arc::new(Sandbox::new(
            config.writable_root.clone(),
            config.sandbox_enabled,
        ));

        let stdout = Arc::new(OutputStream::new("stdout", StreamMode::StateAware));
        let stderr = Arc::new(OutputStream::new("STDERR", StreamMode::AlwaysBlock));
        let context_file = ContextFile::new(Arc::clone(&context), Arc::clone(&scene));
        let pipeline = Arc::new(ExecPipeline {
            executor: Executor::new(Arc::clone(&context), Arc::clone(&scene)),
            stdout: Arc::clone(&stdout),
            stderr: Arc::clone(&stderr),
            context_file: Arc::clone(&context_file),
        });

        let terms = TermsDir::new(config.clone(), Arc::clone(&sandbox));
        let routes = RoutesManager::new(config.rio_mount.clone());

        // scene/
        let scene_dir = Dir::new("scene");
        scene_dir.add_file(Arc::new(CtlFile::new(
            "ctl",
            Box::new(SceneCtlHandler::new(Arc::clone(&pipeline))),
        )));
        scene_dir.add_file(ParseFile::new(Arc::clone(&pipeline)));
        scene_dir.add_file(StreamOutFile::new("stdout", stdout));
        scene_dir.add_file(StreamOutFile::new("STDERR", stderr));
        scene_dir.add_file(VarsFile::new(Arc::clone(&context)));
        scene_dir.add_file(StateFile::new(Arc::clone(&pipeline)));
        scene_dir.add_file(VersionFile::new(Arc::clone(&scene)));

        // /
        let dir = Dir::new("");
        dir.add_file(Arc::new(CtlFile::new(
            "ctl",
            Box::new(RootCtlHandler {
                config: config.clone(),
                scene: Arc::clone(&scene),
                context: Arc::clone(&context),
                terms: Arc::clone(&terms),
                routes: Arc::clone(&routes),
            }),
        )));
        dir.add_file(ScreenFile::new(Arc::clone(&scene)));
        dir.add_file(context_file);
        dir.add_file(RoutesFile::new(Arc::clone(&routes)));
        dir.add_dir(Arc::clone(terms.dir()));
        dir.add_dir(scene_dir);

        let server = FileServer::new(Arc::clone(&dir));
        routes.bind_server(&server);

        info!(
            width = config.width,
            height = config.height,
            mount = %config.rio_mount,
            "riod tree assembled"
        );

        Arc::new(Self {
            config,
            dir,
            server,
            scene,
            context,
            pipeline,
            terms,
            routes,
            sandbox,
        })
    }

    /// Stop route workers and tear down terminals.
    pub fn shutdown(&self) {
        self.routes.stop_all();
        self.terms.shutdown_all();
        info!("riod tree shut down");
    }
}

// ========== root ctl ==========

struct RootCtlHandler {
    config: RioConfig,
    scene: Arc<Mutex<SceneManager>>,
    context: Arc<Mutex<ExecutionContext>>,
    terms: Arc<TermsDir>,
    routes: Arc<RoutesManager>,
}

#[async_trait]
impl CtlHandler for RootCtlHandler {
    async fn execute(&self, verb: &str, arg: &str) -> FsResult<Option<String>> {
        match verb {
            "refresh" => {
                self.scene.lock().await.refresh();
                Ok(None)
            }
            "clear" => {
                let vars = self.context.lock().await.primitive_vars();
                let mut scene = self.scene.lock().await;
                scene.take_snapshot("before clear", "", vars);
                scene.clear();
                Ok(None)
            }
            "export" => Ok(Some(self.scene.lock().await.to_json())),
            "import" => {
                if arg.is_empty() {
                    return Err(FsError::usage("import <json>"));
                }
                let imported = self.scene.lock().await.from_json(arg)?;
                Ok(Some(format!("imported {imported} item(s)")))
            }
            "size" => {
                let mut parts = arg.split_whitespace();
                let (w, h) = match (parts.next(), parts.next()) {
                    (Some(w), Some(h)) => (w, h),
                    _ => return Err(FsError::usage("size <width> <height>")),
                };
                let w: u32 = w.parse().map_err(|_| FsError::usage("size <width> <height>"))?;
                let h: u32 = h.parse().map_err(|_| FsError::usage("size <width> <height>"))?;
                let mut scene = self.scene.lock().await;
                scene.width = w;
                scene.height = h;
                scene.refresh();
                Ok(None)
            }
            "background" => {
                let mut scene = self.scene.lock().await;
                if arg.is_empty() {
                    return Ok(Some(scene.background.clone()));
                }
                scene.background = arg.to_string();
                scene.refresh();
                Ok(None)
            }
            "save" => {
                let path = if arg.is_empty() {
                    self.config.state_path.clone()
                } else {
                    std::path::PathBuf::from(arg)
                };
                self.scene.lock().await.save_state(&path)?;
                Ok(Some(format!("saved {}", path.display())))
            }
            "load" => {
                let path = if arg.is_empty() {
                    self.config.state_path.clone()
                } else {
                    std::path::PathBuf::from(arg)
                };
                self.scene.lock().await.load_state(&path)?;
                Ok(Some(format!("loaded {}", path.display())))
            }
            "term" => {
                let id = self.terms.register_terminal()?;
                Ok(Some(format!("term {id} created")))
            }
            "delterm" => {
                if arg.is_empty() {
                    return Err(FsError::usage("delterm <term_id>"));
                }
                self.terms.unregister_terminal(arg)?;
                Ok(None)
            }
            other => Err(FsError::usage(format!("unknown command: {other}"))),
        }
    }

    async fn status(&self) -> String {
        let scene = self.scene.lock().await;
        format!(
            "width {}\nheight {}\nbackground {}\nitems {}\nversion {}\nterminals {}\nroutes {}\n",
            scene.width,
            scene.height,
            scene.background,
            scene.item_count(),
            scene.versions.current_version(),
            self.terms.count(),
            self.routes.count(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::OpenMode;
    use std::time::Duration;
    use tokio::time::timeout;

    fn root() -> Arc<RioRoot> {
        RioRoot::new(RioConfig {
            stdout_debounce_ms: 50,
            ..RioConfig::default()
        })
    }

    async fn write_file(root: &Arc<RioRoot>, path: &[&str], data: &[u8]) {
        let srv = &root.server;
        let fid = srv.walk(srv.attach(), path).unwrap();
        srv.open(fid, OpenMode::Write).await.unwrap();
        srv.write(fid, 0, data).await.unwrap();
        srv.clunk(fid).await.unwrap();
    }

    async fn read_file(root: &Arc<RioRoot>, path: &[&str]) -> Vec<u8> {
        let srv = &root.server;
        let fid = srv.walk(srv.attach(), path).unwrap();
        srv.open(fid, OpenMode::Read).await.unwrap();
        let mut out = Vec::new();
        loop {
            let chunk = srv.read(fid, out.len() as u64, 4096).await.unwrap();
            if chunk.is_empty() {
                break;
            }
            out.extend(chunk);
        }
        srv.clunk(fid).await.unwrap();
        out
    }

    #[tokio::test]
    async fn tree_layout_matches_contract() {
        let root = root();
        let listing = String::from_utf8(
            root.server
                .read(root.server.attach(), 0, 4096)
                .await
                .unwrap(),
        )
        .unwrap();
        assert_eq!(listing, "ctl\nscreen\nCONTEXT\nroutes\nterms/\nscene/\n");

        let fid = root.server.walk(root.server.attach(), &["scene"]).unwrap();
        let scene_listing =
            String::from_utf8(root.server.read(fid, 0, 4096).await.unwrap()).unwrap();
        assert_eq!(
            scene_listing,
            "ctl\nparse\nstdout\nSTDERR\nvars\nstate\nversion\n"
        );
    }

    #[tokio::test]
    async fn idle_stdout_empty_but_stderr_blocks() {
        let root = root();
        let srv = &root.server;

        let out_fid = srv.walk(srv.attach(), &["scene", "stdout"]).unwrap();
        let got = timeout(Duration::from_millis(10), srv.read(out_fid, 0, 4096))
            .await
            .expect("idle stdout must answer immediately")
            .unwrap();
        assert!(got.is_empty());

        let err_fid = srv.walk(srv.attach(), &["scene", "STDERR"]).unwrap();
        let blocked = timeout(Duration::from_millis(100), srv.read(err_fid, 0, 4096)).await;
        assert!(blocked.is_err(), "idle STDERR must block");
    }

    #[tokio::test]
    async fn parse_submission_full_stack() {
        let root = root();
        write_file(&root, &["scene", "parse"], b"x = 1\nprint(x)\n").await;

        let out = read_file(&root, &["scene", "stdout"]).await;
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "1\n→ None\n✓ Version 1\n"
        );

        let version = String::from_utf8(read_file(&root, &["scene", "version"]).await).unwrap();
        assert!(version.contains("current 1"));
        assert!(version.contains("can_undo false"));
    }

    #[tokio::test]
    async fn export_clear_import_round_trip_via_ctl() {
        let root = root();
        write_file(&root, &["scene", "parse"], b"box = rect(5, 5, 20, 20)\n").await;
        // Drain stdout so the next submission's batch is clean.
        read_file(&root, &["scene", "stdout"]).await;

        write_file(&root, &["scene", "ctl"], b"export\n").await;
        let payload = read_file(&root, &["scene", "ctl"]).await;
        let payload_str = String::from_utf8(payload).unwrap();
        assert!(payload_str.contains("\"items\""));

        write_file(&root, &["scene", "ctl"], b"clear\n").await;
        assert_eq!(root.scene.lock().await.item_count(), 0);

        let import_cmd = format!("import {}", payload_str.replace('\n', " "));
        write_file(&root, &["ctl"], import_cmd.as_bytes()).await;
        assert_eq!(root.scene.lock().await.item_count(), 1);

        let vars = String::from_utf8(read_file(&root, &["scene", "vars"]).await).unwrap();
        assert!(vars.contains("box"));
    }

    #[tokio::test]
    async fn unknown_ctl_verb_is_usage() {
        let root = root();
        let srv = &root.server;
        let fid = srv.walk(srv.attach(), &["ctl"]).unwrap();
        assert!(matches!(
            srv.write(fid, 0, b"frobnicate now\n").await,
            Err(FsError::Usage(_))
        ));
    }

    #[tokio::test]
    async fn error_routes_to_terminal_output() {
        let root = root();
        let Ok(term_id) = root.terms.register_terminal() else {
            return; // no PTY here
        };

        let route_line = format!("/scene/STDERR -> /terms/{term_id}/output\n");
        write_file(&root, &["routes"], route_line.as_bytes()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Trigger an execution error.
        write_file(&root, &["scene", "parse"], b"boom(\n").await;

        let got = timeout(
            Duration::from_secs(2),
            read_file(&root, &["terms", &term_id, "output"]),
        )
        .await
        .expect("routed error must reach terminal output");
        assert!(String::from_utf8_lossy(&got).contains("SyntaxError"));

        let listing = String::from_utf8(read_file(&root, &["routes"]).await).unwrap();
        assert!(listing.contains("[running]"));

        write_file(&root, &["routes"], b"-/scene/STDERR\n").await;
        let listing = String::from_utf8(read_file(&root, &["routes"]).await).unwrap();
        assert_eq!(listing, "(no routes)\n");

        root.shutdown();
    }

    #[tokio::test]
    async fn state_copy_restore_round_trip() {
        let root = root();
        write_file(&root, &["scene", "parse"], b"n = 7\nbox = rect(0, 0, 9, 9)\n").await;

        let envelope = read_file(&root, &["scene", "state"]).await;
        let pre_versions = root.scene.lock().await.versions.len();

        write_file(&root, &["scene", "ctl"], b"clear\n").await;
        assert_eq!(root.scene.lock().await.item_count(), 0);

        write_file(&root, &["scene", "state"], &envelope).await;

        let scene = root.scene.lock().await;
        assert!(scene.versions.len() >= pre_versions);
        assert_eq!(
            scene.versions.current_snapshot().unwrap().label,
            "restored session"
        );
        assert_eq!(scene.item_count(), 1);
    }

    #[tokio::test]
    async fn screen_read_returns_png() {
        let root = root();
        let png = read_file(&root, &["screen"]).await;
        assert_eq!(&png[..8], &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]);
    }
}
