use crate::cache::prune::{Selector, DATE_FORMAT};
use crate::cache::{ManifestHolder, Store};
use crate::command;
use crate::configuration::CacheConfig;
use argh::FromArgs;

#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand, name = "list", description = "Print the cached manifests")]
pub struct Options {
    #[argh(option, short = 'p')]
    /// comma-separated regular expressions matched against image URLs
    pub patterns: Option<String>,
    #[argh(switch)]
    /// also print manifest digests
    pub digests: bool,
}

pub struct Command {
    store: Store,
    selector: Option<Selector>,
    digests: bool,
}

fn format_line(holder: &ManifestHolder, digests: bool) -> String {
    let mut line = format!(
        "{} {} created={} pulled={}",
        holder.image_url,
        holder.kind,
        holder.created.format(DATE_FORMAT),
        holder.pulled.format(DATE_FORMAT)
    );
    if digests {
        line.push(' ');
        line.push_str(&holder.digest.to_string());
    }
    line
}

impl Command {
    pub fn new(options: &Options, config: &CacheConfig) -> Result<Self, command::Error> {
        let selector = options
            .patterns
            .as_deref()
            .map(Selector::patterns)
            .transpose()?;

        Ok(Self {
            store: Store::new(config.image_path.clone(), config.sync_to_disk),
            selector,
            digests: options.digests,
        })
    }

    pub async fn lines(&self) -> Result<Vec<String>, command::Error> {
        let mut holders: Vec<ManifestHolder> = self
            .store
            .walk()
            .await?
            .into_iter()
            .map(|(holder, _)| holder)
            .filter(|holder| {
                self.selector
                    .as_ref()
                    .is_none_or(|selector| selector.matches(holder))
            })
            .collect();
        holders.sort_by(|a, b| a.image_url.cmp(&b.image_url));

        Ok(holders
            .iter()
            .map(|holder| format_line(holder, self.digests))
            .collect())
    }

    pub async fn run(&self) -> Result<(), command::Error> {
        for line in self.lines().await? {
            println!("{line}");
        }
        Ok(())
    }
}
