use axum::{
    routing::{get, post},
    Router,
};
use rand::seq::IndexedRandom;

use crate::AppState;

mod guest;
mod logout;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/guest", post(guest::guest))
        .route("/logout", get(logout::logout))
}

const ADJECTIVES: [&str; 25] = [
    "Quick", "Lazy", "Mysterious", "Jolly", "Brave", "Silent", "Witty", "Fierce",
    "Clever", "Gentle", "Wild", "Calm", "Bold", "Shy", "Proud", "Happy", "Sad",
    "Eager", "Fancy", "Rusty", "Golden", "Silver", "Bright", "Dark", "Lucky",
];

const NOUNS: [&str; 24] = [
    "Fox", "Bear", "Eagle", "Wolf", "Dragon", "Tiger", "Lion", "Owl", "Rabbit",
    "Falcon", "Hawk", "Shark", "Panda", "Kitten", "Puppy", "Phoenix", "Griffin",
    "Unicorn", "Turtle", "Dolphin", "Whale", "Elephant", "Giraffe", "Zebra",
];

/// Display name for guests who did not pick one, e.g. "Jolly Owl".
pub(crate) fn random_alias() -> String {
    let mut rng = rand::rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("Anonymous");
    let noun = NOUNS.choose(&mut rng).copied().unwrap_or("Guest");
    format!("{adjective} {noun}")
}
