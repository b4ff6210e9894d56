use testrelay::error::AppResult;

fn main() -> AppResult<()> {
    testrelay::entry::run()
}
