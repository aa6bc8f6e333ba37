use argh::FromArgs;

#[derive(FromArgs, PartialEq, Debug)]
/// run the HTTP server
#[argh(subcommand, name = "serve")]
pub(crate) struct SpkRepoServe {}

#[derive(FromArgs, PartialEq, Debug)]
/// run pending database migrations and exit
#[argh(subcommand, name = "migrate")]
pub(crate) struct SpkRepoMigrate {}

#[derive(FromArgs, PartialEq, Debug)]
/// populate the reference tables (architectures, firmwares, languages, roles, services)
#[argh(subcommand, name = "populate")]
pub(crate) struct SpkRepoPopulate {}

#[derive(FromArgs, PartialEq, Debug)]
/// reset the database (all the existing data will be deleted)
#[argh(subcommand, name = "reset")]
pub(crate) struct SpkRepoReset {}

#[derive(FromArgs, PartialEq, Debug)]
/// generate a new signing key and print setup instructions
#[argh(subcommand, name = "gen-key")]
pub(crate) struct SpkRepoGenKey {
    /// the fingerprint or user ID to generate a key for
    #[argh(option)]
    pub uid: String,
}

#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand)]
pub(crate) enum SpkRepoCommand {
    Serve(SpkRepoServe),
    Migrate(SpkRepoMigrate),
    Populate(SpkRepoPopulate),
    Reset(SpkRepoReset),
    GenKey(SpkRepoGenKey),
}

#[derive(FromArgs, PartialEq, Debug)]
/// spk-repo: a package repository server for Synology NAS appliances
pub(crate) struct SpkRepo {
    /// specify the location of the config file
    #[argh(option, short = 'c')]
    pub config: String,
    #[argh(subcommand)]
    pub command: SpkRepoCommand,
}
