//! A scripted change-tracking session printed to the terminal.

use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tandem_client::{ClientError, TrackState};
use tandem_transform::{Doc, Transform};

const INITIAL_TEXT: &str = "Type something, and then commit it.";

const WORDS: &[&str] = &["tandem", "edit", "commit", "blame", "revert", "step", "map"];

fn random_edit(doc: &Doc, rng: &mut StdRng) -> Result<Transform, ClientError> {
    let mut tr = Transform::new(doc.clone());
    for _ in 0..rng.gen_range(1..=2) {
        let size = tr.doc().content_size();
        let from = rng.gen_range(0..=size);
        if size > 0 && rng.gen_bool(0.3) {
            let to = (from + rng.gen_range(1..=4)).min(size);
            tr.delete(from, to)?;
        } else {
            let word = WORDS[rng.gen_range(0..WORDS.len())];
            tr.insert(from, format!(" {}", word))?;
        }
    }
    Ok(tr)
}

/// Type the initial text, make `commits` random commits, revert one of them
/// and print the history with the final blame map.
pub fn run(commits: usize, seed: Option<u64>) -> Result<(), ClientError> {
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let mut doc = Doc::empty();
    let mut track = TrackState::new(&doc);

    let mut tr = Transform::new(doc.clone());
    tr.insert(0, INITIAL_TEXT)?;
    track.apply_transform(&tr)?;
    doc = tr.doc().clone();
    track.apply_commit("Initial commit", Utc::now());

    for i in 1..=commits {
        let tr = random_edit(&doc, &mut rng)?;
        track.apply_transform(&tr)?;
        doc = tr.doc().clone();
        track.apply_commit(format!("Change {}", i), Utc::now());
    }

    let target = rng.gen_range(0..track.commits().len());
    let revert = track.revert_commit(target, &doc)?;
    if revert.doc_changed() {
        track.apply_transform(&revert)?;
        doc = revert.doc().clone();
        if let Some(message) = track.revert_message(target) {
            track.apply_commit(message, Utc::now());
        }
    } else {
        println!("Commit {} no longer changes anything", target);
    }

    println!("\nCommits:");
    for (i, commit) in track.commits().iter().enumerate() {
        println!("  {:>3}  {}  {}", i, commit.time.format("%H:%M"), commit.message);
    }

    println!("\nBlame:");
    for span in track.blame_map() {
        let who = span
            .commit
            .and_then(|i| track.commits().get(i))
            .map_or("(untracked)", |c| c.message.as_str());
        let text = doc.slice(span.from, span.to)?;
        println!("  {:>4}..{:<4} {:<24} {:?}", span.from, span.to, who, text);
    }

    println!("\nDocument:\n  {}", doc.text());
    Ok(())
}
