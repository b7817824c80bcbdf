use async_stream::stream;
use futures::stream::{Stream, StreamExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tandem_client::{connect, ClientError, ConnectionConfig, ConnectionHandle, LocalTransport};
use tandem_server::{seed, ClientId, MemoryStorage, Registry, ServerConfig};
use tandem_transform::Step;
use tracing::{debug, warn};

const DOC_ID: &str = "simulation";

/// How long editors get to catch up once all edits are submitted.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Statistics collected during a simulation run
#[derive(Clone, Debug)]
pub struct SimulationStats {
    pub num_editors: usize,
    pub edits_per_editor: usize,
    pub server_version: u64,
    pub comments: usize,
    pub doc_size: usize,
    pub total_time: Duration,
    pub settle_time: Duration,
    pub edits_per_second: f64,
    pub converged: bool,
}

impl SimulationStats {
    pub fn print(&self) {
        println!("\n╔════════════════════════════════════════════════════════════╗");
        println!("║              Simulation Statistics                         ║");
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║  Editors:                   {:>30} ║", self.num_editors);
        println!("║  Edits per Editor:          {:>30} ║", self.edits_per_editor);
        println!("║  Server Version:            {:>30} ║", self.server_version);
        println!("║  Comments:                  {:>30} ║", self.comments);
        println!("║  Final Document Size:       {:>30} ║", self.doc_size);
        println!("║  Total Time:                {:>29}s ║", format!("{:.3}", self.total_time.as_secs_f64()));
        println!("║  Settle Time:               {:>28}ms ║", self.settle_time.as_millis());
        println!("║  Edits/Second:              {:>30.0} ║", self.edits_per_second);
        println!("║  Converged:                 {:>30} ║", if self.converged { "yes" } else { "NO" });
        println!("╚════════════════════════════════════════════════════════════╝");
    }
}

/// One random edit. Positions are fractions of the document size at the
/// time the edit is made, since the generator does not see documents.
#[derive(Clone, Copy, Debug)]
enum Edit {
    Insert { at: f64, len: usize },
    Delete { at: f64, len: usize },
    Comment { at: f64, len: usize },
}

/// Generator that yields which editor makes which edit
fn edit_generator(num_editors: usize, num_edits: usize, seed: Option<u64>) -> impl Stream<Item = (usize, Edit)> {
    stream! {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        for _ in 0..num_edits {
            let editor = rng.gen_range(0..num_editors);
            let at = rng.gen::<f64>();
            let edit = match rng.gen_range(0..10) {
                0..=5 => Edit::Insert { at, len: rng.gen_range(1..6) },
                6..=8 => Edit::Delete { at, len: rng.gen_range(1..4) },
                _ => Edit::Comment { at, len: rng.gen_range(1..8) },
            };
            yield (editor, edit);
        }
    }
}

fn random_text(rng: &mut StdRng, len: usize) -> String {
    (0..len).map(|_| rng.gen_range(b'a'..=b'z') as char).collect()
}

async fn perform_edit(
    handle: &ConnectionHandle,
    edit: Edit,
    rng: &mut StdRng,
) -> Result<(), ClientError> {
    let status = handle.status();
    let size = status.doc.map_or(0, |doc| doc.content_size());
    let pos = |at: f64| ((at * size as f64) as usize).min(size);
    let result = match edit {
        Edit::Insert { at, len } => {
            let step = Step::insert(pos(at), random_text(rng, len));
            handle.edit(status.revision, vec![step]).await
        }
        Edit::Delete { at, len } => {
            let from = pos(at);
            let to = (from + len).min(size);
            if from == to {
                return Ok(());
            }
            handle.edit(status.revision, vec![Step::delete(from, to)]).await
        }
        Edit::Comment { at, len } => {
            let from = pos(at);
            let to = (from + len).min(size);
            if from == to {
                return Ok(());
            }
            handle
                .add_comment(status.revision, from, to, random_text(rng, 6))
                .await
        }
    };
    match result {
        Err(ClientError::InvalidComment { from, to }) => {
            debug!(from, to, "comment range vanished before it was applied");
            Ok(())
        }
        other => other,
    }
}

/// Run `num_editors` editors against an in-process server, each making
/// about `edits_per_editor` random edits, then wait for them to agree.
pub async fn simulate(
    num_editors: usize,
    edits_per_editor: usize,
    seed: Option<u64>,
) -> Result<SimulationStats, ClientError> {
    let num_editors = num_editors.max(1);
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║        Collaborative Editing Simulation                    ║");
    println!("║  Editors: {} | Edits/Editor: {}", num_editors, edits_per_editor);
    println!("╚════════════════════════════════════════════════════════════╝");

    let start = Instant::now();
    let registry = Arc::new(Registry::new(
        ServerConfig::default(),
        Arc::new(MemoryStorage::new()),
    ));
    registry.create(DOC_ID, seed::default_doc(), Vec::new());

    let mut handles = Vec::with_capacity(num_editors);
    for i in 0..num_editors {
        let transport = LocalTransport::new(registry.clone(), DOC_ID, format!("editor-{}", i));
        let (handle, driver) = connect(transport, ClientId(i as u32 + 1), ConnectionConfig::default());
        driver.spawn();
        handle.wait_for(|s| s.doc.is_some()).await?;
        handles.push(handle);
    }

    println!("\n[Phase 1/2] Editing...");

    let total_edits = num_editors * edits_per_editor;
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(1)),
        None => StdRng::from_entropy(),
    };
    let mut edits = Box::pin(edit_generator(num_editors, total_edits, seed));
    let mut done = 0;
    while let Some((editor, edit)) = edits.next().await {
        debug!(editor, ?edit, "Applying edit");
        perform_edit(&handles[editor], edit, &mut rng).await?;
        done += 1;
        if done % 10 == 0 {
            tokio::task::yield_now().await;
        }
        if done % 100 == 0 {
            println!("  Edits submitted: {}/{}", done, total_edits);
        }
    }

    println!("[Phase 1/2] ✓ Completed");
    println!("[Phase 2/2] Waiting for editors to settle...");

    let settle_start = Instant::now();
    let converged = match tokio::time::timeout(SETTLE_TIMEOUT, settle(&registry, &handles)).await {
        Ok(result) => result?,
        Err(_) => {
            warn!("Editors did not settle within {:?}", SETTLE_TIMEOUT);
            false
        }
    };
    let settle_time = settle_start.elapsed();

    println!("[Phase 2/2] ✓ Completed");

    let snapshot = registry.snapshot(DOC_ID, "simulation");
    let total_time = start.elapsed();
    Ok(SimulationStats {
        num_editors,
        edits_per_editor,
        server_version: snapshot.version,
        comments: snapshot.comments.len(),
        doc_size: snapshot.doc.content_size(),
        total_time,
        settle_time,
        edits_per_second: total_edits as f64 / total_time.as_secs_f64(),
        converged,
    })
}

/// Wait until every editor is idle at the server's version, then compare
/// documents and comments with the server's.
async fn settle(registry: &Arc<Registry>, handles: &[ConnectionHandle]) -> Result<bool, ClientError> {
    loop {
        let target = registry.snapshot(DOC_ID, "simulation");
        let mut statuses = Vec::with_capacity(handles.len());
        for handle in handles {
            let status = handle
                .wait_for(|s| {
                    s.is_synced()
                        && s.version >= target.version
                        && s.comment_version >= target.comment_version
                })
                .await?;
            statuses.push(status);
        }
        let snapshot = registry.snapshot(DOC_ID, "simulation");
        if statuses
            .iter()
            .any(|s| s.version != snapshot.version || s.comment_version != snapshot.comment_version)
        {
            continue;
        }
        let converged = statuses.iter().all(|s| {
            s.doc.as_ref() == Some(&snapshot.doc) && s.comments.len() == snapshot.comments.len()
        });
        return Ok(converged);
    }
}
