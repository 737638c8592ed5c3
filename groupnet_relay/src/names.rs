// Name assignment for peers that join with an empty requested name.
//
// Candidates come from a built-in animal list or a name file. Each pick
// starts at a random point in the candidate list and takes the first name no
// live connection in the group holds; once every plain candidate is in use,
// numbered variants (`Fox2`, `Fox3`, ...) are tried. The caller supplies the
// "is taken" check and must hold the registry lock across pick + insert,
// which is what makes concurrent empty-name joins receive distinct names.

use rand::Rng;
use rand::seq::SliceRandom;

const BUILTIN_NAMES: &[&str] = &[
    "Ant", "Bat", "Bear", "Beaver", "Bee", "Bird", "Bison", "Boar", "Buffalo", "Camel", "Cat",
    "Cheetah", "Chicken", "Cobra", "Cow", "Crab", "Crane", "Crow", "Deer", "Dingo", "Dog",
    "Dolphin", "Dove", "Duck", "Eagle", "Elephant", "Ferret", "Fish", "Fly", "Fox", "Frog",
    "Gecko", "Goat", "Goldfish", "Hamster", "Hawk", "Hippo", "Horse", "Hyena", "Kangaroo",
    "Kitten", "Lion", "Lizard", "Lobster", "Monkey", "Moose", "Mouse", "Octopus", "Otter", "Owl",
    "Ox", "Panda", "Parrot", "Peacock", "Pig", "Pigeon", "Puppy", "Python", "Raccoon", "Rat",
    "Raven", "Scorpion", "Seal", "Shark", "Sheep", "Snail", "Snake", "Spider", "Squirrel",
    "Tiger", "Turkey", "Whale", "Wolf", "Zebra",
];

/// Source of fresh peer names.
#[derive(Clone, Debug)]
pub struct NameGenerator {
    candidates: Vec<String>,
}

impl NameGenerator {
    /// Use the given candidates (shuffled). Empty and duplicate entries are
    /// dropped.
    pub fn new(candidates: impl IntoIterator<Item = String>) -> Self {
        let mut candidates: Vec<String> =
            candidates.into_iter().filter(|c| !c.is_empty()).collect();
        candidates.sort();
        candidates.dedup();
        candidates.shuffle(&mut rand::thread_rng());
        Self { candidates }
    }

    /// Generator over the built-in animal names.
    pub fn builtin() -> Self {
        Self::new(BUILTIN_NAMES.iter().map(|s| (*s).to_owned()))
    }

    pub fn candidate_count(&self) -> usize {
        self.candidates.len()
    }

    /// Pick a name for which `is_taken` returns false. Returns `None` only
    /// when there are no candidates at all.
    pub fn pick(&self, is_taken: impl Fn(&str) -> bool) -> Option<String> {
        if self.candidates.is_empty() {
            return None;
        }
        let start = rand::thread_rng().gen_range(0..self.candidates.len());
        let rotated = || {
            self.candidates[start..]
                .iter()
                .chain(&self.candidates[..start])
        };

        if let Some(name) = rotated().find(|c| !is_taken(c)) {
            return Some(name.clone());
        }
        // Only finitely many names can be taken, so some suffix is free.
        (2u64..)
            .flat_map(|suffix| rotated().map(move |c| format!("{c}{suffix}")))
            .find(|name| !is_taken(name))
    }
}

impl Default for NameGenerator {
    fn default() -> Self {
        Self::builtin()
    }
}
